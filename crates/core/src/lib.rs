pub mod config;
pub mod error;
pub mod event;
pub mod filesystem;
pub mod terminal;

pub use config::{
    ComputerConfig, ComputerLimits, MainThreadConfig, SchedulerConfig, TimeoutConfig, load_dotenv,
};
pub use error::CoreError;
pub use event::Event;
pub use filesystem::{FileSystem, MemoryMount, Mount, WritableMount};
pub use terminal::{Colour, Terminal};
