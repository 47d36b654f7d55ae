use clap::Parser;
use shutterbox_http::serve;

#[derive(Parser)]
#[command(
    name = "shutterbox",
    version,
    about = "Kiosk capture store with store-and-forward replication"
)]
struct Cli {
    #[arg(long, env = "SHUTTERBOX_DATA_DIR", default_value = "./data")]
    data_dir: String,
    #[arg(long, env = "SHUTTERBOX_BIND_ADDR", default_value = "127.0.0.1:8080")]
    bind_addr: String,
    /// `kiosk` captures and forwards; `central` receives kiosk batches.
    #[arg(
        long,
        env = "SHUTTERBOX_MODE",
        default_value = "kiosk",
        value_parser = ["kiosk", "central"]
    )]
    mode: String,
    /// Remote central store (kiosk mode). Unset runs standalone.
    #[arg(long, env = "SHUTTERBOX_REMOTE_URL")]
    remote_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    std::env::set_var("SHUTTERBOX_DATA_DIR", &cli.data_dir);
    std::env::set_var("SHUTTERBOX_BIND_ADDR", &cli.bind_addr);
    std::env::set_var("SHUTTERBOX_MODE", &cli.mode);
    if let Some(url) = &cli.remote_url {
        std::env::set_var("SHUTTERBOX_REMOTE_URL", url);
    }
    serve().await
}
