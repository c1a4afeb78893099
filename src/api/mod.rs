// Wire types: the render request schema and the responses built from it.

pub mod request;
pub mod response;
