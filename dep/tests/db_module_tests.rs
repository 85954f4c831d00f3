//! Tests for database module exports and the global store.

use koa_dep::db;

#[test]
fn test_db_module_exports_checksum_function() {
    let checksum = db::calculate_checksum(b"test data");
    assert_eq!(checksum.len(), 32); // MD5 produces 32 hex characters
    assert_eq!(checksum, db::calculate_checksum(b"test data"));
    assert_ne!(checksum, db::calculate_checksum(b"other data"));
}

#[test]
fn test_file_md5_matches_content_checksum() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.fits");
    std::fs::write(&path, b"SIMPLE  =                    T").unwrap();

    let md5 = db::file_md5(&path).unwrap();
    assert_eq!(md5, db::calculate_checksum(b"SIMPLE  =                    T"));
    assert_eq!(db::md5sum_line(&md5, &path), format!("{}  frame.fits\n", md5));
}

#[test]
fn test_file_md5_missing_file() {
    assert!(db::file_md5(std::path::Path::new("/nonexistent/frame.fits")).is_err());
}

#[cfg(not(feature = "postgres-repo"))]
#[test]
fn test_pool_stats_fallback_exists() {
    let stats = db::PoolStats::default();
    let _ = format!("{:?}", stats);
}

#[tokio::test]
async fn test_init_repository_is_idempotent() {
    let config = db::RepositoryConfig::default();
    let first = db::init_repository(&config).await.unwrap();
    let second = db::init_repository(&config).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(first, second));
    assert!(db::get_repository().is_ok());
}
