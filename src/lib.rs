pub mod command;
pub mod config;
pub mod event;
pub mod host;
pub mod isupport;
pub mod mask;
pub mod masklist;
pub mod queue;
pub mod service;
pub mod time;
pub mod user;

pub use self::command::Error;
pub use self::config::Config;
pub use self::event::Event;
pub use self::host::{Context, Host, Member};
pub use self::service::Service;
pub use self::time::Posix;
