/// Flock protocol and system constants.

/// Membership protocol version. Bumped on any incompatible change to a
/// non-discovery message. Discovery messages (type ids below
/// [`DISCOVERY_TYPE_CUTOFF`]) stay byte-compatible across versions so that
/// version mismatches can be detected and reported at all.
pub const FLOCK_PROTO_VER: u16 = 0x0003;

/// Frame magic, first four bytes of every frame on the wire.
pub const FRAME_MAGIC: u32 = 0x464C_4B31; // "FLK1"

/// Message type ids strictly below this value belong to the
/// discovery/broadcast namespace; ids at or above it are directed.
pub const DISCOVERY_TYPE_CUTOFF: u16 = 32;

/// Default cluster communication port.
pub const FLOCK_LISTEN_PORT: u16 = 7300;

/// Maximum members in a cluster (member arena capacity).
pub const MAX_MEMBERS: usize = 4096;

/// Maximum logical sub-services (service arena capacity).
pub const MAX_SERVICES: usize = 256;

/// Size of the fixed frame prefix: magic + proto_ver + type_id.
pub const FRAME_PREFIX_LEN: usize = 4 + 2 + 2;

/// Encoded size of a member uid inside the frame header.
pub const UID_WIRE_LEN: usize = 16;
