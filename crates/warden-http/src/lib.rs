mod buffered;
mod head;
mod headers;
mod message;
mod wire;

pub use buffered::{BufferedStream, PrefixedIo, HEAD_CHUNK_SIZE};
pub use head::{read_request_head, read_response_head, RequestTarget};
pub use headers::{
    connection_close, restore_upgrade, strip_hop_by_hop, upgrade_type, warning, WARNING_AGENT,
};
pub use message::{
    read_body_bytes, Body, BodyFraming, BodyStream, BoxedDuplex, Duplex, Request, Response,
    Version,
};
pub use wire::{
    should_flush, write_request, write_response, write_response_head, FlushMode,
};
