use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

use shoene_directory::{
    discover_region_files, EnrichmentOrchestrator, HttpRegistryClient, PipelineOptions,
    RegistryClient, RegistryConfig, SqliteCompanyRepository,
};

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    if args.len() > 1 && args[1] == "import" {
        run_import(&args[2..])
    } else {
        print_usage();
        Ok(())
    }
}

fn print_usage() {
    println!("shoene-directory {}", shoene_directory::VERSION);
    println!();
    println!("Usage:");
    println!("  shoene-directory import [flags]");
    println!();
    println!("Flags:");
    println!("  --data-dir DIR    Region extracts directory (default: data)");
    println!("  --db PATH         SQLite database path (default: directory.db)");
    println!("  --skip-registry   Fast mode: no corporate-number enrichment");
    println!("  --dry-run         Statistics only, no writes");
    println!();
    println!("Environment:");
    println!("  CORPORATE_API_TOKEN       token for the corporate-number search service");
    println!("  REGISTRY_INFO_API_TOKEN   token for the registry-info service");
}

fn run_import(flags: &[String]) -> Result<()> {
    let mut data_dir = PathBuf::from("data");
    let mut db_path = PathBuf::from("directory.db");
    let mut skip_registry = false;
    let mut dry_run = false;

    let mut iter = flags.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--data-dir" => {
                data_dir = PathBuf::from(iter.next().context("--data-dir needs a value")?);
            }
            "--db" => {
                db_path = PathBuf::from(iter.next().context("--db needs a value")?);
            }
            "--skip-registry" => skip_registry = true,
            "--dry-run" => dry_run = true,
            other => anyhow::bail!("Unknown flag: {other}"),
        }
    }

    println!("🗄️  Certified-company directory import");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // 1. Discover region files (sorted: fixed, reproducible order)
    println!("\n📂 Scanning {}...", data_dir.display());
    let files = discover_region_files(&data_dir)?;
    anyhow::ensure!(
        !files.is_empty(),
        "No region files found in {}",
        data_dir.display()
    );
    println!("✓ Found {} region files", files.len());

    // 2. Open database
    println!("\n🔧 Setting up database...");
    let mut repo = SqliteCompanyRepository::open(&db_path)?;
    println!("✓ Database initialized with WAL mode");

    // 3. Registry client: configuration read once, injected by reference -
    //    never re-derived from the environment per call
    let client = build_registry_client(skip_registry)?;
    if skip_registry {
        println!("\n⏩ Fast mode: corporate-number enrichment skipped");
    }
    if dry_run {
        println!("\n🔍 Dry run: statistics only, nothing will be written");
    }

    // 4. Run the batch
    println!("\n💾 Importing {} regions...", files.len());
    let options = PipelineOptions {
        enrich: client.is_some(),
        dry_run,
        ..Default::default()
    };
    let registry_ref = client.as_ref().map(|c| c as &dyn RegistryClient);
    let stats = EnrichmentOrchestrator::new(&mut repo, registry_ref, options).run(&files);

    // 5. Summary
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📊 Run summary");
    print!("{}", stats.summary());

    if stats.files_failed == 0 && stats.errors == 0 {
        println!("\n🎉 Import complete!");
    } else {
        println!(
            "\n✅ Import finished: {} file failures, {} row errors (see log for first occurrences)",
            stats.files_failed, stats.errors
        );
    }

    Ok(())
}

fn build_registry_client(skip_registry: bool) -> Result<Option<HttpRegistryClient>> {
    if skip_registry {
        return Ok(None);
    }

    let corporate_token = env::var("CORPORATE_API_TOKEN").unwrap_or_default();
    let info_token = env::var("REGISTRY_INFO_API_TOKEN").unwrap_or_default();

    if corporate_token.is_empty() || info_token.is_empty() {
        println!("\n⚠️  Registry tokens missing - continuing without enrichment");
        return Ok(None);
    }

    let config = RegistryConfig::new(corporate_token, info_token);
    Ok(Some(HttpRegistryClient::new(config)?))
}
