use pagecache::config::Config;
use pagecache::error::Result;
use pagecache::harness::RandomHarness;
use pagecache::storage::new_filesystem;

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path for the stress run")
                .default_value("config/pcstress.yaml"),
        )
        .get_matches();
    let file = args.get_one::<String>("config").map(String::as_str).unwrap_or_default();
    let cfg = Config::new(file)?;
    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let fs = new_filesystem(cfg.storage_type, &cfg.data_dir)?;
    let harness = RandomHarness::new(cfg.harness, cfg.cache)?;
    let report = harness.run(fs)?;
    println!("{}", report);
    Ok(())
}
