pub mod browser;
pub mod detail;
pub mod guard;
pub mod pipeline;
pub mod search;

pub use browser::ChromeSession;
pub use guard::StdinSignal;
pub use pipeline::Pipeline;
