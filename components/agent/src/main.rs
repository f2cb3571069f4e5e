use beaver::cli;

#[tokio::main]
async fn main() {
    // The entrypoint delegates to the CLI layer, which parses flags and
    // drives the runtime; the exit code carries the shutdown cause.
    let code = cli::cli::run().await;
    if code != 0 {
        std::process::exit(code);
    }
}
