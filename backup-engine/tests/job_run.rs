//! End-to-end job runs against local and mounted storages.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, TimeZone};
use flate2::read::GzDecoder;
use tar::Archive;
use tempfile::TempDir;

use backup_engine::archive::pax::{parse_dumpdir, DUMPDIR_KEY};
use backup_engine::{AppContext, BackupError, Config, Job};

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    root: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let fixture = Self {
            root: TempDir::new().unwrap(),
        };
        fs::create_dir_all(fixture.nas()).unwrap();
        fixture
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    fn data(&self) -> PathBuf {
        self.path("data")
    }

    fn local(&self) -> PathBuf {
        self.path("local")
    }

    fn nas(&self) -> PathBuf {
        self.path("nas")
    }

    fn write(&self, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.data().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    /// A config with one `nas` storage and `job` appended verbatim.
    fn config(&self, job: &str) -> Config {
        let toml = format!(
            r#"
tmp_dir = "{tmp}"

[[storage]]
name = "nas"
type = "nfs"
mount_point = "{nas}"
{job}
"#,
            tmp = self.path("tmp").display(),
            nas = self.nas().display(),
            job = job
                .replace("{data}", &self.data().display().to_string())
                .replace("{local}", &self.local().display().to_string()),
        );
        Config::from_toml(&toml).unwrap()
    }

    async fn job(&self, job: &str) -> Job {
        let ctx = AppContext::new(self.config(job));
        ctx.build_job(&ctx.config.jobs[0]).await.unwrap()
    }
}

fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Local> {
    Local.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

fn set_mtime(path: &Path, mtime: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(mtime)
        .unwrap();
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Entry name to its PAX records, for a gzipped archive.
fn pax_records(path: &Path) -> HashMap<String, HashMap<String, Vec<u8>>> {
    let mut archive = Archive::new(GzDecoder::new(fs::File::open(path).unwrap()));
    let mut out = HashMap::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let mut records = HashMap::new();
        if let Some(exts) = entry.pax_extensions().unwrap() {
            for ext in exts {
                let ext = ext.unwrap();
                records.insert(ext.key().unwrap().to_string(), ext.value_bytes().to_vec());
            }
        }
        let name = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
        let mut body = Vec::new();
        entry.read_to_end(&mut body).unwrap();
        out.insert(name, records);
    }
    out
}

const DESC_JOB: &str = r#"
[[job]]
name = "files"
type = "desc_files"
deferred_copying_level = LEVEL

[[job.sources]]
name = "apps"
targets = ["{data}/app-*"]

[[job.sources]]
name = "config"
targets = ["{data}/etc"]

[[job.storages]]
storage = "local"
backup_path = "{local}"
retention = { days = 7 }

[[job.storages]]
storage = "nas"
backup_path = "share"
retention = { days = 7 }
"#;

const INC_JOB: &str = r#"
[[job]]
name = "svc"
type = "inc_files"

[[job.sources]]
name = "services"
targets = ["{data}/svc"]

[[job.storages]]
storage = "local"
backup_path = "{local}"
retention = { months = 3 }
"#;

fn safety_job(safety: bool) -> String {
    format!(
        r#"
[[job]]
name = "svc"
type = "desc_files"
safety_backup = {}

[[job.sources]]
name = "services"
targets = ["{{data}}/svc"]

[[job.storages]]
storage = "local"
backup_path = "{{local}}"
retention = {{ days = 1 }}
"#,
        safety
    )
}

// ============================================================================
// Descriptive jobs
// ============================================================================

#[tokio::test]
async fn deferred_copying_controls_delivery_rounds() {
    // (level, expected rounds) for 3 targets in 2 sources
    for (level, rounds) in [(0, 3), (1, 2), (2, 1), (7, 1)] {
        let fx = Fixture::new();
        fx.write("app-1/index.html", b"one");
        fx.write("app-2/index.html", b"two");
        fx.write("etc/app.conf", b"conf");

        let mut job = fx.job(&DESC_JOB.replace("LEVEL", &level.to_string())).await;
        // Local is configured first but delivered last
        assert!(job.backends.last().unwrap().is_local());

        let report = job.run_at(at(2026, 10, 16, 2)).await;
        assert!(report.is_clean(), "level {}: {:?}", level, report.errors);
        assert_eq!(report.delivery_rounds, rounds, "level {}", level);
        assert_eq!(report.delivered, 3);

        for key in ["app-1", "app-2", "etc"] {
            let name = format!("{}_2026-10-16_02-00-00.tar.gz", key);
            let remote = fx.nas().join("share").join(key).join("daily").join(&name);
            let local = fx.local().join(key).join("daily").join(&name);
            assert!(remote.exists(), "{}", remote.display());
            assert!(fs::symlink_metadata(&local).unwrap().is_file());
        }
        assert!(!fx.path("tmp/files").exists());
    }
}

#[tokio::test]
async fn unreachable_storage_still_delivers_elsewhere() {
    let fx = Fixture::new();
    fx.write("app-1/index.html", b"one");
    fx.write("etc/app.conf", b"conf");
    fs::remove_dir(fx.nas()).unwrap();

    let mut job = fx.job(&DESC_JOB.replace("LEVEL", "0")).await;
    assert_eq!(job.backends.len(), 1);

    let report = job.run_at(at(2026, 10, 16, 2)).await;
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(&report.errors[0], BackupError::Storage { backend, .. } if backend == "nas"));
    assert_eq!(report.delivered, 2);
    assert!(fx
        .local()
        .join("etc/daily/etc_2026-10-16_02-00-00.tar.gz")
        .exists());
}

// ============================================================================
// Incremental jobs
// ============================================================================

#[tokio::test]
async fn reinit_day_runs_each_start_a_chain() {
    let fx = Fixture::new();
    let a = fx.write("svc/a", b"alpha");
    set_mtime(&a, SystemTime::UNIX_EPOCH + Duration::from_secs(1_767_000_000));
    let mut job = fx.job(INC_JOB).await;

    let month = fx.local().join("svc/2026/month_01");
    let meta = fx.local().join("svc/2026/inc_meta_info");

    for hour in [2, 3] {
        let report = job.run_at(at(2026, 1, 1, hour)).await;
        assert!(report.is_clean(), "{:?}", report.errors);
        assert_eq!(report.delivered, 1);

        // Each run is a full baseline and becomes every generation
        let stamp = format!("svc_2026-01-01_{:02}-00-00", hour);
        let entries = pax_records(&month.join(format!("{}.tar.gz", stamp)));
        assert!(entries.contains_key("svc/a"), "{}", stamp);
        let sidecar = fs::read(month.join(format!("{}.inc", stamp))).unwrap();
        for generation in ["day.inc", "month.inc", "year.inc"] {
            assert_eq!(fs::read(meta.join(generation)).unwrap(), sidecar, "{} after {}", generation, stamp);
        }
    }

    assert_eq!(
        file_names(&month),
        vec![
            "svc_2026-01-01_02-00-00.inc",
            "svc_2026-01-01_02-00-00.init",
            "svc_2026-01-01_02-00-00.tar.gz",
            "svc_2026-01-01_03-00-00.inc",
            "svc_2026-01-01_03-00-00.init",
            "svc_2026-01-01_03-00-00.tar.gz",
        ]
    );
    assert_eq!(file_names(&meta), vec!["day.inc", "month.inc", "year.inc"]);

    // The next day diffs against the second baseline
    let next = job.run_at(at(2026, 1, 2, 2)).await;
    assert!(next.is_clean(), "{:?}", next.errors);
    let entries = pax_records(&month.join("svc_2026-01-02_02-00-00.tar.gz"));
    assert_eq!(parse_dumpdir(&entries["svc"][DUMPDIR_KEY]), vec![(b'N', "a".to_string())]);
    assert!(!entries.contains_key("svc/a"));
}

#[tokio::test]
async fn next_day_archive_only_holds_changes() {
    let fx = Fixture::new();
    let a = fx.write("svc/a", b"alpha");
    set_mtime(&a, SystemTime::UNIX_EPOCH + Duration::from_secs(1_767_000_000));
    let mut job = fx.job(INC_JOB).await;

    let first = job.run_at(at(2026, 1, 1, 2)).await;
    assert!(first.is_clean(), "{:?}", first.errors);

    fx.write("svc/b", b"bravo");
    let second = job.run_at(at(2026, 1, 2, 2)).await;
    assert!(second.is_clean(), "{:?}", second.errors);

    let month = fx.local().join("svc/2026/month_01");
    assert!(!month.join("svc_2026-01-02_02-00-00.init").exists());

    let entries = pax_records(&month.join("svc_2026-01-02_02-00-00.tar.gz"));
    let mut tokens = parse_dumpdir(&entries["svc"][DUMPDIR_KEY]);
    tokens.sort();
    assert_eq!(tokens, vec![(b'N', "a".to_string()), (b'Y', "b".to_string())]);
    assert!(!entries.contains_key("svc/a"));
    assert!(entries.contains_key("svc/b"));
}

// ============================================================================
// Safety backups
// ============================================================================

fn plant_expired(fx: &Fixture) -> PathBuf {
    let old = fx.local().join("svc/daily/svc_old.tar.gz");
    fs::create_dir_all(old.parent().unwrap()).unwrap();
    fs::write(&old, b"old").unwrap();
    set_mtime(&old, SystemTime::now() - Duration::from_secs(30 * 86_400));
    old
}

#[tokio::test]
async fn safety_backup_keeps_old_copies_when_build_fails() {
    let fx = Fixture::new();
    fx.write("svc/a", b"alpha");
    let old = plant_expired(&fx);

    let mut job = fx.job(&safety_job(true)).await;
    fs::remove_dir_all(fx.data().join("svc")).unwrap();

    let report = job.run().await;
    assert!(matches!(report.errors.as_slice(), [BackupError::Archive { .. }]));
    assert!(old.exists());

    fx.write("svc/a", b"alpha");
    let report = job.run().await;
    assert!(report.is_clean(), "{:?}", report.errors);
    assert!(!old.exists());

    let kept = file_names(&fx.local().join("svc/daily"));
    assert_eq!(kept.len(), 1);
    assert!(kept[0].starts_with("svc_") && kept[0].ends_with(".tar.gz"));
}

#[tokio::test]
async fn plain_backup_sweeps_before_building() {
    let fx = Fixture::new();
    fx.write("svc/a", b"alpha");
    let old = plant_expired(&fx);

    let mut job = fx.job(&safety_job(false)).await;
    fs::remove_dir_all(fx.data().join("svc")).unwrap();

    let report = job.run().await;
    assert_eq!(report.errors.len(), 1);
    assert!(!old.exists());
}
