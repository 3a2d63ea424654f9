#![allow(dead_code)]

use chrono::TimeDelta;
use rand::{RngCore, SeedableRng, rngs::StdRng};
use std::{io, path::Path, sync::Arc};
use tar::{Builder, EntryType, Header};
use walvault::{
    config::{AppConfig, Backend, DatabaseSettings},
    handlers::AppState,
    services::{storage_service::LocalStore, transform::SecretKey},
};

pub const TEST_KEY: &[u8] = b"0123456789abcdef";

/// Configuration rooted entirely inside `root`.
pub fn test_config(root: &Path) -> AppConfig {
    AppConfig {
        backend: Backend::Local {
            root: root.join("objects"),
        },
        storage_prefix: "pg".to_string(),
        encryption_key: SecretKey::new(TEST_KEY.to_vec()).unwrap(),
        database_id: "db1".to_string(),
        database: DatabaseSettings {
            host: "localhost".to_string(),
            port: 5432,
            name: "app".to_string(),
            user: "replicator".to_string(),
            password: "secret".to_string(),
        },
        data_dir: root.join("data"),
        metrics_lock_path: root.join("walvault.lock"),
        backup_interval: TimeDelta::hours(168),
        basebackup_program: "pg_basebackup".to_string(),
        basebackup_max_rate: "1024M".to_string(),
    }
}

pub fn local_state(config: AppConfig) -> AppState {
    let root = match &config.backend {
        Backend::Local { root } => root.clone(),
        Backend::S3(_) => panic!("tests use the local backend"),
    };
    AppState::new(config, Arc::new(LocalStore::new(root)))
}

pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

pub fn append_dir(builder: &mut Builder<Vec<u8>>, path: &str, mode: u32) {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_mode(mode);
    header.set_size(0);
    builder.append_data(&mut header, path, io::empty()).unwrap();
}

pub fn append_file(builder: &mut Builder<Vec<u8>>, path: &str, mode: u32, data: &[u8]) {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_mode(mode);
    header.set_size(data.len() as u64);
    builder.append_data(&mut header, path, data).unwrap();
}

pub fn append_symlink(builder: &mut Builder<Vec<u8>>, path: &str, target: &str) {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Symlink);
    header.set_mode(0o777);
    header.set_size(0);
    header.set_link_name(target).unwrap();
    builder.append_data(&mut header, path, io::empty()).unwrap();
}

/// A small data directory: two nested directories and three files.
pub fn sample_archive() -> Vec<u8> {
    let mut builder = Builder::new(Vec::new());
    append_dir(&mut builder, "base", 0o700);
    append_dir(&mut builder, "base/1", 0o755);
    append_file(&mut builder, "PG_VERSION", 0o600, b"16\n");
    append_file(&mut builder, "base/1/1259", 0o644, &random_bytes(200 * 1024, 7));
    append_file(&mut builder, "base/1/run.sh", 0o755, b"#!/bin/sh\n");
    builder.into_inner().unwrap()
}
