//! Fetches a page and prints it.
//!
//! ```sh
//! cargo run --example simple_get -- example.com /
//! ```

use std::io::Read;
use std::time::Duration;

use http::Request;
use micro_http_client::config::ConnectorConfig;
use micro_http_client::connection::HttpConnection;
use micro_http_client::protocol::RequestBody;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "example.com".to_owned());
    let path = args.next().unwrap_or_else(|| "/".to_owned());

    let config = ConnectorConfig::default()
        .with_connect_timeout(Some(Duration::from_secs(5)))
        .with_response_timeout(Some(Duration::from_secs(30)));

    let mut connection = HttpConnection::new(format!("{host}:80"), config);
    if let Err(e) = connection.connect().await {
        error!(cause = %e, host, "failed to connect");
        return;
    }

    let request = Request::get(format!("http://{host}{path}")).body(RequestBody::Empty).expect("valid request");
    let response = match connection.send(request).await {
        Ok(response) => response,
        Err(e) => {
            error!(cause = %e, "request failed");
            return;
        }
    };

    info!(status = %response.status(), reason = response.reason_phrase(), "response head");
    for (name, value) in response.headers() {
        info!(%name, value = ?value, "header");
    }

    let body = response.body().clone();
    let text = tokio::task::spawn_blocking(move || {
        let mut text = Vec::new();
        (&body).read_to_end(&mut text).map(|_| text)
    })
    .await;

    match text {
        Ok(Ok(text)) => println!("{}", String::from_utf8_lossy(&text)),
        Ok(Err(e)) => error!(cause = %e, "failed to read the body"),
        Err(e) => error!(cause = %e, "body reader panicked"),
    }

    connection.close();
}
