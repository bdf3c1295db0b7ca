//! Primitive identifiers and reserved channels.
//!
//! A channel is a flat 64-bit address. The router imposes no structure on it;
//! the helpers here encode the conventions the server roles agree on.

/// A routable 64-bit channel address.
pub type Channel = u64;

/// A distributed object identifier.
pub type Doid = u32;

/// A zone identifier within a parent object.
pub type Zone = u32;

/// Size prefix used for strings, blobs and wire frames.
pub type DgSize = u32;

/// Width of an encoded channel in bytes.
pub const CHANNEL_SIZE: usize = 8;

/// Width of an encoded size prefix in bytes.
pub const DGSIZE_SIZE: usize = 4;

/// Highest addressable channel.
pub const CHANNEL_MAX: Channel = Channel::MAX;

/// Highest distributed object id.
pub const DOID_MAX: Doid = Doid::MAX;

/// Highest zone id.
pub const ZONE_MAX: Zone = Zone::MAX;

/// Number of low bits a zone occupies in a location channel.
pub const ZONE_BITS: u32 = 32;

/// The never-valid object id.
pub const INVALID_DOID: Doid = 0;

/// The never-valid channel.
pub const INVALID_CHANNEL: Channel = 0;

/// Datagrams addressed solely to this channel are router control operations.
pub const CONTROL_MESSAGE: Channel = 1;

/// Broadcast channel for all client agents.
pub const BCHAN_CLIENTS: Channel = 10;

/// Broadcast channel for all state servers.
pub const BCHAN_STATESERVERS: Channel = 12;

/// Broadcast channel for all database servers.
pub const BCHAN_DBSERVERS: Channel = 13;

/// Prefix for parent-to-children channels.
pub const PARENT_PREFIX: Channel = 1 << ZONE_BITS;

/// Prefix for database-to-object channels.
pub const DATABASE_PREFIX: Channel = 2 << ZONE_BITS;

/// Channel addressing every object located at `(parent, zone)`.
#[must_use]
pub const fn location_as_channel(parent: Doid, zone: Zone) -> Channel {
    ((parent as Channel) << ZONE_BITS) | zone as Channel
}

/// Channel a parent object uses to address all of its children.
#[must_use]
pub const fn parent_to_children(parent: Doid) -> Channel {
    PARENT_PREFIX | parent as Channel
}

/// Channel the database server uses to address an object.
#[must_use]
pub const fn database_to_object(object: Doid) -> Channel {
    DATABASE_PREFIX | object as Channel
}
