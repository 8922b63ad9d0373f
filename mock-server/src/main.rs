//! Serve the mock origin on `127.0.0.1:$PORT` (default 8080).

use std::io::{Error, ErrorKind};
use std::net::SocketAddr;

use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Error> {
    let port: u16 = match std::env::var("PORT") {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::new(ErrorKind::InvalidInput, format!("PORT={raw}: {e}")))?,
        Err(_) => 8080,
    };
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await?;
    println!("mock origin listening on http://{}", listener.local_addr()?);
    println!("routes: /hello /inspect /close /echo /status/{{code}}");
    mock_server::run(listener).await
}
