mod acquisition;
mod capture;
mod config;
mod dwf;
mod error;
mod handoff;
mod instrument;
mod session;
mod sim;
mod tui;
mod utils;
mod writer;

pub use acquisition::*;
pub use capture::*;
pub use config::*;
pub use dwf::*;
pub use error::*;
pub use handoff::*;
pub use instrument::*;
pub use session::*;
pub use sim::*;
pub use tui::*;
pub use utils::*;
pub use writer::*;
