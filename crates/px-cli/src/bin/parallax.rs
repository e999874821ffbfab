use px_optimizer::AdapterRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut registry = AdapterRegistry::new();
    px_cli::demo::register(&mut registry);

    let code = px_cli::run_main(registry).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
