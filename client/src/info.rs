use {
    byte_unit::{Byte, UnitType},
    chrono::{DateTime, Local},
    cloakfs_protocol::{DateTimeUtc, LogicalPath, Metadata},
    cloakfs_sdk::{MirrorResults, cache::CacheStats},
    prettytable::{Table, format::FormatBuilder, row},
    std::fmt::Display,
    tracing::info,
};

pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Max rows logged at once.
const TABLE_CHUNK: usize = 50;

pub fn pretty_size(size: u64) -> impl Display {
    Byte::from_u64(size).get_appropriate_unit(UnitType::Decimal)
}

fn pretty_time(value: Option<DateTimeUtc>) -> String {
    value.map_or_else(
        || "-".into(),
        |value| {
            DateTime::<Local>::from(value)
                .format(DATE_TIME_FORMAT)
                .to_string()
        },
    )
}

fn pretty_kind(entry: &Metadata) -> String {
    if entry.is_dir() {
        "DIR".into()
    } else if let Some(size) = entry.size {
        format!("FILE {:.1}", pretty_size(size))
    } else {
        "FILE".into()
    }
}

fn new_table() -> Table {
    let mut table = Table::new();
    table.set_format(FormatBuilder::new().column_separator(' ').build());
    table
}

/// Names are shown relative to `base` for recursive listings.
fn display_name(entry: &Metadata, base: &LogicalPath, recursive: bool) -> String {
    let Ok(path) = LogicalPath::parse(&entry.name) else {
        return entry.name.clone();
    };
    let name = if recursive {
        path.strip_prefix(base)
    } else {
        path.last_name()
    };
    let name = name.unwrap_or(path.as_str());
    if entry.is_dir() {
        format!("{name}/")
    } else {
        name.to_owned()
    }
}

pub fn print_listing(base: &LogicalPath, entries: &[Metadata], recursive: bool) {
    // directories first, otherwise keep the engine's order
    let mut sorted: Vec<&Metadata> = entries.iter().collect();
    sorted.sort_by_key(|entry| !entry.is_dir());

    let mut table = new_table();
    for entry in sorted {
        table.add_row(row![
            pretty_time(entry.mtime),
            pretty_kind(entry),
            display_name(entry, base, recursive)
        ]);
        if table.len() >= TABLE_CHUNK {
            info!("{table}");
            table = new_table();
        }
    }
    if !table.is_empty() {
        info!("{table}");
    }
    info!("{} entries", entries.len());
}

pub fn print_metadata(entry: &Metadata) {
    let mut table = new_table();
    table.add_row(row!["Path", entry.name]);
    table.add_row(row!["Type", if entry.is_dir() { "directory" } else { "file" }]);
    if let Some(size) = entry.size {
        table.add_row(row!["Size", format!("{size} ({:.1})", pretty_size(size))]);
    }
    table.add_row(row!["Modified", pretty_time(entry.mtime)]);
    table.add_row(row!["Created", pretty_time(entry.ctime)]);
    info!("{table}");
}

pub fn print_cache_stats(stats: Option<CacheStats>) {
    let Some(stats) = stats else {
        info!("cache statistics are only collected for the redis cache");
        return;
    };
    let mut table = new_table();
    table.add_row(row!["get", stats.get]);
    table.add_row(row!["set", stats.set]);
    table.add_row(row!["del", stats.del]);
    table.add_row(row!["flush", stats.flush]);
    table.add_row(row!["hit", stats.hit]);
    table.add_row(row!["miss", stats.miss]);
    table.add_row(row!["hit rate", format!("{:.1}%", stats.hit_rate())]);
    info!("{table}");
}

pub fn print_mirror_results(results: &MirrorResults) {
    info!(
        "copied: {}, skipped: {}, errors: {}",
        results.success, results.skipped, results.errors
    );
}

#[cfg(test)]
mod tests {
    #![expect(clippy::unwrap_used, reason = "test")]

    use super::*;

    #[test]
    fn names() {
        let base = LogicalPath::parse("/docs").unwrap();
        let file = Metadata::file("/docs/a/b.txt", 1);
        let dir = Metadata::directory("/docs/a");
        assert_eq!(display_name(&file, &base, false), "b.txt");
        assert_eq!(display_name(&file, &base, true), "a/b.txt");
        assert_eq!(display_name(&dir, &base, false), "a/");
        assert_eq!(display_name(&dir, &LogicalPath::root(), true), "docs/a/");
    }

    #[test]
    fn kinds() {
        assert_eq!(pretty_kind(&Metadata::directory("/a")), "DIR");
        assert!(pretty_kind(&Metadata::file("/a", 1500)).starts_with("FILE 1.5"));
        assert_eq!(pretty_time(None), "-");
    }
}
