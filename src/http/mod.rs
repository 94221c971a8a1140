pub mod channel;
pub mod connector;
pub mod http_codec;
pub mod http_error;
pub mod ordered_queue;
