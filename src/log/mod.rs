//! Log sink for units and for the supervisor itself.
//!
//! Every unit owns a [`Logger`] with a stdout and a stderr channel. Each
//! channel delivers to the console, to a [`RotatingFile`], or to both through
//! a fan-out [`MultiOutput`]. Child process output is pumped into the
//! channels with [`Output::read_from`].

pub mod logger;
pub mod output;
pub mod rotating;

pub use logger::{Logger, LoggerOptions};
pub use output::{BoxReader, FileOutput, MultiOutput, Output, WriterOutput};
pub use rotating::{RotatingFile, RotatingFileOptions};
