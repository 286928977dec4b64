use confcorpus_core::config::StorageConfig;
use confcorpus_core::RecordStore;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const CONFIG: &str = r#"
[queries]
series_count = "SELECT COUNT(*) AS n FROM eventseries"

[[sources]]
id = "dblp"

[sources.events]
pattern = "fixtures/dblp/events.json"

[sources.series]
pattern = "fixtures/dblp/series.json"

[[sources]]
id = "or"
table_suffix = "orwiki"

[sources.events]
pattern = "fixtures/orwiki/events.csv"
format = "csv"

[sources.series]
pattern = "fixtures/orwiki/series.jsonl"
format = "jsonl"
"#;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_runtime] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        let config_dir = xdg_config.join("confcorpus");
        seed_fixtures(&config_dir.join("fixtures"));
        fs::write(config_dir.join("config.toml"), CONFIG).expect("failed to write config");

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    fn cache_path(&self) -> PathBuf {
        self.xdg_data.join("confcorpus/EventCorpus.db")
    }

    fn fixture(&self, relative: &str) -> PathBuf {
        self.xdg_config.join("confcorpus/fixtures").join(relative)
    }
}

fn seed_fixtures(target: &Path) {
    let source = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../confcorpus-core/tests/fixtures");
    for dir in ["dblp", "orwiki"] {
        fs::create_dir_all(target.join(dir)).expect("failed to create fixture directory");
        for entry in fs::read_dir(source.join(dir)).expect("missing fixture directory") {
            let entry = entry.expect("unreadable fixture entry");
            fs::copy(entry.path(), target.join(dir).join(entry.file_name()))
                .expect("failed to copy fixture");
        }
    }
}

fn run_bin(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("confcorpus"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("failed to execute confcorpus: {e}"))
}

fn describe(args: &[&str], output: &Output) -> String {
    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "confcorpus {rendered_args}\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn assert_success(args: &[&str], output: &Output) {
    if !output.status.success() {
        panic!("command failed\n{}", describe(args, output));
    }
}

#[test]
fn load_populates_cache_and_lists_tables() {
    let env = CliTestEnv::new();

    let args = ["--tables"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("event_dblp\t3\tdblp"), "{}", describe(&args, &output));
    assert!(stdout.contains("eventseries_orwiki\t2\tor"));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("dblp: 3 event(s), 1 series, 1 unresolved series key(s)"));

    let store = RecordStore::open(&StorageConfig::sql(env.cache_path())).expect("failed to open cache");
    assert!(store.view_exists("event").expect("catalogue lookup failed"));
    assert_eq!(store.row_count("event_orwiki").expect("row count failed"), 2);
}

#[test]
fn second_run_uses_cache() {
    let env = CliTestEnv::new();
    assert_success(&[], &run_bin(&env, &[]));

    fs::remove_file(env.fixture("dblp/events.json")).expect("failed to remove fixture");

    let output = run_bin(&env, &[]);
    assert_success(&[], &output);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("dblp: 3 event(s), 1 series, 1 unresolved series key(s) (cached)"));
}

#[test]
fn failing_source_exits_with_code_two() {
    let env = CliTestEnv::new();
    fs::remove_file(env.fixture("dblp/events.json")).expect("failed to remove fixture");

    let args = ["--tables"];
    let output = run_bin(&env, &args);
    assert_eq!(output.status.code(), Some(2), "{}", describe(&args, &output));

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("dblp: FAILED"));
    assert!(stderr.contains("or: 2 event(s)"));

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("event_orwiki\t2\tor"));
    assert!(!stdout.contains("event_dblp"));
}

#[test]
fn export_prints_canonical_csv() {
    let env = CliTestEnv::new();

    let args = ["--export", "or:eventseries"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.split("\r\n").collect();
    assert_eq!(lines[0], "\"eventSeriesId\",\"acronym\",\"title\",\"url\",\"source\"");
    assert_eq!(
        lines[1],
        "\"S1\",\"AAAI\",\"Conference on Artificial Intelligence\",,\"or\""
    );
    assert_eq!(lines.len(), 4);
}

#[test]
fn query_by_name_and_by_sql() {
    let env = CliTestEnv::new();

    let args = ["--query", "series_count"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    assert_eq!(String::from_utf8_lossy(&output.stdout), "\"n\"\r\n3\r\n");

    let args = [
        "--datasources",
        "or",
        "-q",
        "SELECT acronym FROM event WHERE source = 'or' ORDER BY acronym",
    ];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "\"acronym\"\r\n\"AAAI 2021\"\r\n\"WebSci 2019\"\r\n"
    );
}

#[test]
fn import_merges_csv_into_cache() {
    let env = CliTestEnv::new();
    let file = env.fixture("import.csv");
    fs::write(&file, "eventId,acronym,year\r\nQ3,ISWC 2021,2021\r\nQ1,,\"2021\"\r\n")
        .expect("failed to write import file");

    let target = format!("or:event={}", file.display());
    let args = [
        "--import",
        target.as_str(),
        "-q",
        "SELECT eventId, acronym, year FROM event WHERE source = 'or' ORDER BY eventId",
    ];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Imported or:event: 1 added, 1 updated"), "{}", describe(&args, &output));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "\"eventId\",\"acronym\",\"year\"\r\n\
         \"Q1\",\"AAAI 2021\",\"2021\"\r\n\
         \"Q2\",\"WebSci 2019\",2019\r\n\
         \"Q3\",\"ISWC 2021\",2021\r\n"
    );

    let store = RecordStore::open(&StorageConfig::sql(env.cache_path())).expect("failed to open cache");
    assert_eq!(store.row_count("event_orwiki").expect("row count failed"), 3);
}

#[test]
fn list_queries_prints_configured_names() {
    let env = CliTestEnv::new();

    let args = ["--list-queries"];
    let output = run_bin(&env, &args);
    assert_success(&args, &output);
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "series_count\tSELECT COUNT(*) AS n FROM eventseries\n"
    );
}

#[test]
fn unknown_datasource_is_an_error() {
    let env = CliTestEnv::new();

    let args = ["--datasources", "nope"];
    let output = run_bin(&env, &args);
    assert_eq!(output.status.code(), Some(1), "{}", describe(&args, &output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("data source not found: nope"));
}

#[test]
fn invalid_config_exits_with_code_one() {
    let env = CliTestEnv::new();
    let config_path = env.xdg_config.join("confcorpus/config.toml");
    fs::write(&config_path, "[[sources]]\nid = \"\"\n").expect("failed to write config");

    let output = run_bin(&env, &[]);
    assert_eq!(output.status.code(), Some(1), "{}", describe(&[], &output));
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to load configuration"));
}
