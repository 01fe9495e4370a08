//! `rmbg`: remove image backgrounds from the command line

#[cfg(feature = "cli")]
use rmbg_engine::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("rmbg was built without the `cli` feature; rebuild with --features cli");
    std::process::exit(2);
}
