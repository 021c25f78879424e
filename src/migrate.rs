//! Bundle the ledger and IP pool migrations into a host application's migrator.

/// Extend an `sqlx::migrate!()` call with this crate's migrations.
pub trait IncludeMigrations {
    /// Append the `jobs`, `networks` and `ip_leases` migrations.
    fn include_lifecycle_job_migrations(&mut self) -> &mut Self;
}

impl IncludeMigrations for sqlx::migrate::Migrator {
    fn include_lifecycle_job_migrations(&mut self) -> &mut Self {
        let ours = sqlx::migrate!();
        let mut migrations = self.migrations.to_vec();
        migrations.extend(
            ours.migrations
                .iter()
                .filter(|m| !self.migrations.iter().any(|e| e.version == m.version))
                .cloned(),
        );
        migrations.sort_by_key(|m| m.version);
        self.migrations = std::borrow::Cow::Owned(migrations);
        self
    }
}
