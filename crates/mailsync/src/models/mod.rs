//! Domain models for the mirror

mod label;
mod message;
mod progress;
mod sync_state;

pub use label::{Label, LabelId};
pub use message::{
    BodyPart, EmailAddress, Header, Message, MessageDetail, MessageId, MessagePayload,
    MessageStub, ThreadId,
};
pub use progress::{CURSOR_FINISHED, SyncKind, SyncProgress, SyncStatus, TransitionError};
pub use sync_state::{UserId, UserSyncState, cursor_advances};
