pub mod layout;
mod reader;

#[cfg(test)]
pub mod mock;

pub use reader::{CodeDump, ImageMemory, ReadMemory};

#[cfg(test)]
pub use mock::{MockMemoryBuilder, MockMemoryReader};
