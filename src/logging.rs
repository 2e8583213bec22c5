use std::fmt::Display;

use anyhow::{Context, Result};
use colored::Colorize;
use log::{Level, LevelFilter};

/// External crates only need to log warnings and errors
const ALLOWED_EXTERNAL_LEVELS: [Level; 2] = [Level::Warn, Level::Error];

pub fn init_logger(level: LevelFilter) -> Result<()> {
    fern::Dispatch::new()
        .format(move |out, message, record| {
            let target = Target::from_str(record.target());
            let now = chrono::Local::now();

            out.finish(format_args!(
                "{:^5} {} {:^8} {}",
                level_to_string(&record.level()),
                now.format("%H:%M:%S").to_string().bright_black(),
                target,
                message
            ))
        })
        .filter(move |meta| should_log(&Target::from_str(meta.target()), meta.level(), level))
        .chain(std::io::stdout())
        .apply()
        .context("installing logger")
}

/// The configured level applies to every target; external crates are further
/// limited to warnings and errors.
fn should_log(target: &Target, level: Level, max: LevelFilter) -> bool {
    let is_allowed = level <= max;
    let is_severe = ALLOWED_EXTERNAL_LEVELS.contains(&level);

    is_allowed && (target.is_local() || is_severe)
}

#[derive(Debug, PartialEq, Eq)]
enum Target {
    External(String),
    Http,
    Store,
    Auth,
    Media,
    Server,
}

impl Target {
    fn from_str(str: &str) -> Self {
        let mut split = str.split("::");
        let krate = split.next().unwrap_or_default();
        let module = split.next();

        match (krate, module) {
            ("backend", _) => Self::Http,
            ("watchparty", Some("store")) => Self::Store,
            ("watchparty", Some("auth" | "security")) => Self::Auth,
            ("watchparty", Some("youtube")) => Self::Media,
            ("watchparty", _) => Self::Server,
            (other, _) => Self::External(other.to_string()),
        }
    }

    fn is_local(&self) -> bool {
        !matches!(self, Self::External(_))
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            Target::External(x) => x.as_str().clear(),
            Target::Http => "HTTP".bright_green(),
            Target::Store => "STORE".blue(),
            Target::Auth => "AUTH".bright_purple(),
            Target::Media => "MEDIA".bright_cyan(),
            Target::Server => "SERVER".bright_white(),
        };

        Display::fmt(&result, f)
    }
}

fn level_to_string(level: &Level) -> String {
    match level {
        Level::Error => " ERR ".black().on_red().bold().to_string(),
        Level::Warn => " WRN ".black().on_yellow().bold().to_string(),
        Level::Info => " INF ".black().on_blue().bold().to_string(),
        Level::Debug => " DBG ".white().on_black().to_string(),
        Level::Trace => " TRC ".to_string(),
    }
}
