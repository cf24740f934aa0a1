pub mod forwarder;
pub mod scanner;

pub use forwarder::{Forwarder, ForwarderError};
pub use scanner::{AddressFamily, ListeningPort, Scanner, ScannerError, ScannerFilter};
