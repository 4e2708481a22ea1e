pub mod api;
pub mod events;
pub mod models;

pub use events::{ChangeKind, Frame, RawChange, RowChange};
pub use models::{MessageRow, NotificationRow, UserId};
