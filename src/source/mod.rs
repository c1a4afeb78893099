// Where remote assets come from. HTTP is the only backend today.

pub mod http_source;
pub mod traits;
