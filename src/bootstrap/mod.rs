mod server;
mod shutdown;
mod state;

pub use server::Server;
pub use shutdown::{ShutdownManager, ShutdownState};
pub use state::{NumberService, ServiceOptions};
