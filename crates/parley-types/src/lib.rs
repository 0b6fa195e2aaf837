pub mod clock;
pub mod events;
pub mod models;
pub mod palette;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::ClientEvent;
pub use models::{
    Attachment, AttachmentKind, Message, NewMessage, QUICK_REACTIONS, ReactionState, UserRecord,
};
pub use palette::{Identity, USER_COLORS, default_color, random_color};
