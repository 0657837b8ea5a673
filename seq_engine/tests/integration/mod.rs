mod common;

mod channel_io;
mod registry;
mod scenario_level;
mod scheduler;
