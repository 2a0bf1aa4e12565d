use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let port = std::env::var("PORT").unwrap_or_else(|_| "3000".to_string());
    let vst_port = std::env::var("VST_PORT").unwrap_or_else(|_| "3001".to_string());

    let http = TcpListener::bind(format!("127.0.0.1:{port}")).await?;
    let binary = TcpListener::bind(format!("127.0.0.1:{vst_port}")).await?;
    tracing::info!(http = %port, binary = %vst_port, "mock server listening");
    mock_server::serve(http, binary).await
}
