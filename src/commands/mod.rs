pub mod health;
pub mod live_stream;
pub mod upload_stream;
