// Hand-off collaborators: object storage, batch submission and webhook notification.

pub mod batch;
pub mod notify;
pub mod storage;
