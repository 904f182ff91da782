//! Output modules: datafeed consumers that render the stream to a file
//! format.

pub mod vcd;
