pub mod commands;
pub mod registrar;

pub use commands::{Command, CommandManager, CommandState, LocalCommandQueue};
pub use registrar::{ClaimTicket, CloudCommandProxy, CloudRegistrar, GcdState};
