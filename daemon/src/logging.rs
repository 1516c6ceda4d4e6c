use std::io::Write;
use std::sync::OnceLock;

use log::LevelFilter;

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// Installs the process-wide logger. `RUST_LOG` overrides the default `info` level.
pub fn init() {
    LOGGER_INIT.get_or_init(|| {
        let mut builder = env_logger::Builder::new();
        builder
            .filter_level(LevelFilter::Info)
            .parse_default_env()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    &record.level().as_str()[..1],
                    record.args()
                )
            });
        if let Err(err) = builder.try_init() {
            eprintln!("failed to initialize logging: {err}");
        }
    });
}
