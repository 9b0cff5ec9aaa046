mod body;
mod client;
mod connection;

pub use body::BodyReader;
pub use client::Http1ClientConnection;
pub use connection::Http1Connection;
