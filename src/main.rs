#[tokio::main]
async fn main() {
    if let Err(error) = market_stream_link::run().await {
        eprintln!("market-stream-link: {error}");
        std::process::exit(1);
    }
}
