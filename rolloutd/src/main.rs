use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = rolloutd::Cli::parse();
    if let Err(err) = rolloutd::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
