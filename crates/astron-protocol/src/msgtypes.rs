//! Message type identifiers understood by the message director.
//!
//! Only control messages are interpreted by the router. Every other message
//! type is opaque and forwarded untouched.

/// Control message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ControlMessage {
    /// Subscribe the sender to one channel.
    AddChannel = 9000,
    /// Unsubscribe the sender from one channel.
    RemoveChannel = 9001,
    /// Subscribe the sender to an inclusive channel range.
    AddRange = 9002,
    /// Unsubscribe the sender from an inclusive channel range.
    RemoveRange = 9003,
    /// Register a datagram to route when the sender disconnects.
    AddPostRemove = 9010,
    /// Discard the post-remove datagrams registered under a channel.
    ClearPostRemoves = 9011,
    /// Name the sender's connection for diagnostics.
    SetConName = 9012,
    /// Attach a URL to the sender's connection for diagnostics.
    SetConUrl = 9013,
}

pub const CONTROL_ADD_CHANNEL: u16 = ControlMessage::AddChannel as u16;
pub const CONTROL_REMOVE_CHANNEL: u16 = ControlMessage::RemoveChannel as u16;
pub const CONTROL_ADD_RANGE: u16 = ControlMessage::AddRange as u16;
pub const CONTROL_REMOVE_RANGE: u16 = ControlMessage::RemoveRange as u16;
pub const CONTROL_ADD_POST_REMOVE: u16 = ControlMessage::AddPostRemove as u16;
pub const CONTROL_CLEAR_POST_REMOVES: u16 = ControlMessage::ClearPostRemoves as u16;
pub const CONTROL_SET_CON_NAME: u16 = ControlMessage::SetConName as u16;
pub const CONTROL_SET_CON_URL: u16 = ControlMessage::SetConUrl as u16;

impl From<ControlMessage> for u16 {
    fn from(msg: ControlMessage) -> u16 {
        msg as u16
    }
}

impl TryFrom<u16> for ControlMessage {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            CONTROL_ADD_CHANNEL => Ok(ControlMessage::AddChannel),
            CONTROL_REMOVE_CHANNEL => Ok(ControlMessage::RemoveChannel),
            CONTROL_ADD_RANGE => Ok(ControlMessage::AddRange),
            CONTROL_REMOVE_RANGE => Ok(ControlMessage::RemoveRange),
            CONTROL_ADD_POST_REMOVE => Ok(ControlMessage::AddPostRemove),
            CONTROL_CLEAR_POST_REMOVES => Ok(ControlMessage::ClearPostRemoves),
            CONTROL_SET_CON_NAME => Ok(ControlMessage::SetConName),
            CONTROL_SET_CON_URL => Ok(ControlMessage::SetConUrl),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_conversion() {
        assert_eq!(ControlMessage::try_from(9000), Ok(ControlMessage::AddChannel));
        assert_eq!(ControlMessage::try_from(9003), Ok(ControlMessage::RemoveRange));
        assert_eq!(ControlMessage::try_from(9013), Ok(ControlMessage::SetConUrl));
        assert_eq!(u16::from(ControlMessage::ClearPostRemoves), 9011);
        assert_eq!(ControlMessage::try_from(9004), Err(9004));
    }
}
