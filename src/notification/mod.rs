//! Business notification hooks.

pub mod dispatcher;

pub use dispatcher::{
    ErrorMessageHook, ExceptionHook, MessageHook, Notification, NotificationDispatcher, ReplyHook,
};
