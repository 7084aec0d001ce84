//! Embedded SQL migrations, bundled into the binary at compile time so the
//! crate ships as a single file with no sidecar `migrations/` directory to
//! lose track of.

use rust_embed::RustEmbed;

#[derive(RustEmbed)]
#[folder = "migrations/"]
#[include = "*.sql"]
pub struct MigrationAssets;

impl MigrationAssets {
    /// Returns `(filename, contents)` pairs sorted by filename, which in
    /// turn sorts by the numeric prefix each migration is named with.
    pub fn get_migrations() -> Vec<(String, String)> {
        let mut migrations: Vec<(String, String)> = Self::iter()
            .map(|name| {
                let contents = Self::get(&name)
                    .map(|file| String::from_utf8_lossy(&file.data).into_owned())
                    .unwrap_or_default();
                (name.to_string(), contents)
            })
            .collect();
        migrations.sort_by(|a, b| a.0.cmp(&b.0));
        migrations
    }
}
