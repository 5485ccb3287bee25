#[tokio::main]
async fn main() {
    if let Err(e) = guardian_angel_lib::run().await {
        eprintln!("guardian-angel: {}", e);
        std::process::exit(1);
    }
}
