//! End-to-end pipeline scenarios: real files in, file-transport sink out.

use beaver::config::config::{BeaverConfig, CliOverrides};
use beaver::helpers::shutdown::Shutdown;
use beaver::runtime::runtime::run_with_shutdown;
use beaver::transports::TransportRegistry;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Pipeline {
    _dir: tempfile::TempDir,
    input: PathBuf,
    output: PathBuf,
    config: Arc<BeaverConfig>,
}

fn pipeline() -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.log");
    let output = dir.path().join("out.jsonl");
    std::fs::File::create(&input).unwrap();

    let config_path = dir.path().join("beaver.toml");
    std::fs::write(
        &config_path,
        format!(
            "[beaver]\n\
             logstash_version = 0\n\
             transport = \"file\"\n\
             file_transport_output_path = \"{}\"\n\
             sincedb_path = \"{}\"\n\
             sincedb_write_interval = 0\n\
             files = [\"{}\"]\n",
            output.display(),
            dir.path().join("sincedb").display(),
            input.display()
        ),
    )
    .unwrap();
    let config =
        Arc::new(BeaverConfig::load(Some(&config_path), CliOverrides::default()).unwrap());

    Pipeline {
        _dir: dir,
        input,
        output,
        config,
    }
}

fn start(config: Arc<BeaverConfig>) -> (Shutdown, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let shutdown = Shutdown::new();
    let handle = tokio::spawn(run_with_shutdown(
        config,
        TransportRegistry::builtin(),
        None,
        shutdown.clone(),
    ));
    (shutdown, handle)
}

fn append(path: &Path, data: &str) {
    let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    file.write_all(data.as_bytes()).unwrap();
    file.flush().unwrap();
}

fn messages(output: &Path) -> Vec<String> {
    let Ok(contents) = std::fs::read_to_string(output) else {
        return Vec::new();
    };
    contents
        .lines()
        .map(|line| {
            serde_json::from_str::<serde_json::Value>(line).unwrap()["@message"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect()
}

/// Poll until the sink holds exactly `expected`, in order. Seeing more
/// lines than expected is an immediate failure (duplicates).
async fn output_becomes(output: &Path, expected: &[&str], timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        let found = messages(output);
        if found.len() > expected.len() {
            return false;
        }
        if found == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

async fn stop(
    shutdown: Shutdown,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
) {
    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("pipeline did not stop in time")
        .expect("pipeline task panicked")
        .expect("pipeline returned an error");
}

#[tokio::test]
async fn tails_a_file_into_the_file_transport_in_order() {
    let p = pipeline();
    let (shutdown, handle) = start(Arc::clone(&p.config));
    tokio::time::sleep(Duration::from_millis(300)).await;

    append(&p.input, "Test1\n");
    assert!(output_becomes(&p.output, &["Test1"], Duration::from_secs(10)).await);

    append(&p.input, "Test2\n");
    assert!(output_becomes(&p.output, &["Test1", "Test2"], Duration::from_secs(10)).await);

    stop(shutdown, handle).await;
}

#[tokio::test]
async fn restart_delivers_each_line_exactly_once() {
    let p = pipeline();

    let (shutdown, handle) = start(Arc::clone(&p.config));
    tokio::time::sleep(Duration::from_millis(300)).await;
    append(&p.input, "one\ntwo\n");
    assert!(output_becomes(&p.output, &["one", "two"], Duration::from_secs(10)).await);
    stop(shutdown, handle).await;

    // Second run against the unchanged file: nothing replays.
    let (shutdown, handle) = start(Arc::clone(&p.config));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(messages(&p.output), vec!["one", "two"]);

    append(&p.input, "three\n");
    assert!(output_becomes(&p.output, &["one", "two", "three"], Duration::from_secs(10)).await);
    stop(shutdown, handle).await;
}

#[tokio::test]
async fn survives_rotation_by_rename_and_create() {
    let p = pipeline();
    let (shutdown, handle) = start(Arc::clone(&p.config));
    tokio::time::sleep(Duration::from_millis(300)).await;

    append(&p.input, "before\n");
    assert!(output_becomes(&p.output, &["before"], Duration::from_secs(10)).await);

    let rotated = p.input.with_extension("log.1");
    std::fs::rename(&p.input, &rotated).unwrap();
    std::fs::File::create(&p.input).unwrap();
    append(&p.input, "after\n");

    assert!(output_becomes(&p.output, &["before", "after"], Duration::from_secs(10)).await);
    stop(shutdown, handle).await;
}
