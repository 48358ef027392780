pub mod header;
pub mod uri;

pub use header::{HEADER_SIZE, Header, MessageKind, fabric_tag};
pub use uri::{format_uri, parse_uri};
