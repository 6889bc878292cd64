#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    if let Err(err) = gantry::run().await {
        // The subscriber may not exist yet if the failure happened before
        // the logger step, so the message also goes to stderr.
        tracing::error!(error = %err, kind = err.kind(), "startup failed");
        eprintln!("fatal: {err}");
        std::process::exit(1);
    }
}
