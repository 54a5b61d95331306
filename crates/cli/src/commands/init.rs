//! `routewise init`: first-time setup.

use routewise_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("Routewise setup");
    println!("===============\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("\nConfig already exists at: {}", config_path.display());
        println!("   Edit it manually or delete it and re-run init.\n");
        return Ok(());
    }

    std::fs::write(&config_path, AppConfig::default_toml())?;
    println!("Created config.toml at: {}", config_path.display());

    let data_dir = AppConfig::default().data_dir();
    std::fs::create_dir_all(&data_dir)?;
    println!("Data directory: {}", data_dir.display());

    println!("\nNext steps:");
    println!("   1. Optionally point documents.chunks_file at a JSONL corpus");
    println!("   2. Run: routewise ask \"Calculate 12 * 7\"");
    println!("   3. Or start a session: routewise chat\n");

    Ok(())
}
