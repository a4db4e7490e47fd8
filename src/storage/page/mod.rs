mod formatter;

pub use formatter::*;
