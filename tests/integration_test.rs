use mapperlink::indexing::mapper_xml::MapperXmlExtractor;
use mapperlink::indexing::extract::MarkupExtractor;
use mapperlink::{
    compute_digest, compute_digests_parallel, CacheEngine, CancellationToken, CodeElementRecord,
    Config, DigestOptions, ElementKind, Extractors, FileState, IndexStore, InvalidationOutcome,
    LogProgress, MarkupElementRecord, ProgressSink, RefreshScope, Result, SourceFile,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const MAPPER_XML_PATH: &str = "src/main/resources/mapper/UserMapper.xml";
const MAPPER_JAVA_PATH: &str = "src/main/java/com/x/UserMapper.java";
const DAO_JAVA_PATH: &str = "src/main/java/com/x/dao/UserDao.java";

const MAPPER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<mapper namespace="com.x.UserMapper">
    <select id="findById" resultType="User">
        select * from users where id = #{id}
    </select>
    <insert id="insertUser">
        insert into users (id, name) values (#{id}, #{name})
    </insert>
</mapper>
"#;

const MAPPER_JAVA: &str = r#"package com.x;

public interface UserMapper {
    User findById(String id);

    int insertUser(User user);
}
"#;

const DAO_JAVA: &str = r#"package com.x.dao;

import org.apache.ibatis.session.SqlSession;

public class UserDao {
    private static final String NS = "com.x.UserMapper";
    private SqlSession session;

    public User load(String id) {
        return session.selectOne(NS + ".findById", id);
    }
}
"#;

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// Mapper XML and its interface, optionally with a DAO calling it
fn create_project(with_dao: bool) -> TempDir {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    write(root, MAPPER_XML_PATH, MAPPER_XML);
    write(root, MAPPER_JAVA_PATH, MAPPER_JAVA);
    if with_dao {
        write(root, DAO_JAVA_PATH, DAO_JAVA);
    }
    temp_dir
}

fn config_for(root: &Path) -> Config {
    let mut config = Config::new(root);
    config.worker_threads = 2;
    config
}

fn open_engine(root: &Path) -> CacheEngine {
    CacheEngine::open(&config_for(root)).unwrap()
}

fn refresh(engine: &CacheEngine) {
    let report = engine
        .refresh_all(&LogProgress, &CancellationToken::new())
        .unwrap();
    assert!(report.is_complete(), "{}", report.summary());
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

type Snapshot = (
    BTreeMap<String, Vec<CodeElementRecord>>,
    BTreeMap<String, Vec<MarkupElementRecord>>,
    BTreeMap<String, String>,
);

fn snapshot(engine: &CacheEngine, files: &[&str]) -> Snapshot {
    let store = engine.store();
    let code = files
        .iter()
        .map(|f| (f.to_string(), store.code_records_for_file(f).unwrap()))
        .collect();
    let markup = files
        .iter()
        .map(|f| (f.to_string(), store.markup_records_for_file(f).unwrap()))
        .collect();
    (code, markup, store.all_digests().unwrap())
}

#[test]
fn test_scenario_a_links_markup_and_code() -> Result<()> {
    let temp_dir = create_project(false);
    let engine = open_engine(temp_dir.path());
    refresh(&engine);

    let files = engine.get_files_for(["com.x.UserMapper.findById"])?;
    assert_eq!(files, set(&[MAPPER_XML_PATH, MAPPER_JAVA_PATH]));

    let ids = engine.get_logical_ids_for(&temp_dir.path().join(MAPPER_XML_PATH))?;
    assert_eq!(
        ids,
        set(&[
            "com.x.UserMapper",
            "com.x.UserMapper.findById",
            "com.x.UserMapper.insertUser"
        ])
    );
    Ok(())
}

#[test]
fn test_usages_are_linked() -> Result<()> {
    let temp_dir = create_project(true);
    let engine = open_engine(temp_dir.path());
    refresh(&engine);

    let records = engine.records_for("com.x.UserMapper.findById")?;
    let usages: Vec<&CodeElementRecord> = records
        .code
        .iter()
        .filter(|r| r.kind == ElementKind::Usage)
        .collect();
    assert_eq!(usages.len(), 1);
    assert_eq!(usages[0].file_path, DAO_JAVA_PATH);
    assert_eq!(
        engine.get_files_for(["com.x.UserMapper.findById"])?,
        set(&[DAO_JAVA_PATH, MAPPER_XML_PATH, MAPPER_JAVA_PATH])
    );
    assert_eq!(engine.counts()?.usages, 1);
    Ok(())
}

#[test]
fn test_refresh_is_idempotent() -> Result<()> {
    let temp_dir = create_project(true);
    let engine = open_engine(temp_dir.path());
    let files = [MAPPER_XML_PATH, MAPPER_JAVA_PATH, DAO_JAVA_PATH];

    refresh(&engine);
    let first = snapshot(&engine, &files);
    refresh(&engine);
    let second = snapshot(&engine, &files);

    assert_eq!(first, second);
    assert_eq!(first.2.len(), 3);
    Ok(())
}

#[test]
fn test_offsets_stay_within_file() -> Result<()> {
    let temp_dir = create_project(true);
    let engine = open_engine(temp_dir.path());
    refresh(&engine);

    for file in [MAPPER_XML_PATH, MAPPER_JAVA_PATH, DAO_JAVA_PATH] {
        let len = fs::metadata(temp_dir.path().join(file))?.len() as usize;
        for record in engine.store().code_records_for_file(file)? {
            assert!(record.start_offset < record.end_offset);
            assert!(record.end_offset <= len);
        }
        for record in engine.store().markup_records_for_file(file)? {
            assert!(record.start_offset < record.end_offset);
            assert!(record.end_offset <= len);
        }
    }
    Ok(())
}

#[test]
fn test_invalidation_reparses_every_file_sharing_an_id() -> Result<()> {
    let temp_dir = create_project(false);
    let root = temp_dir.path();
    let engine = open_engine(root);
    refresh(&engine);

    // Shift every offset in the interface and drop insertUser
    write(
        root,
        MAPPER_JAVA_PATH,
        "package com.x;\n\n\n// moved\npublic interface UserMapper {\n    User findById(String id);\n}\n",
    );
    let outcome = engine.invalidate_file(&root.join(MAPPER_JAVA_PATH))?;
    assert_eq!(
        outcome,
        InvalidationOutcome::Reparsed {
            reparsed: 2,
            purged: 0,
            failed: 0
        }
    );

    let records = engine.records_for("com.x.UserMapper.findById")?;
    assert_eq!(records.code.len(), 1);
    assert_eq!(records.markup.len(), 1);
    let text = fs::read_to_string(root.join(MAPPER_JAVA_PATH))?;
    let decl = &records.code[0];
    assert_eq!(&text[decl.start_offset..decl.end_offset], "findById");

    // The markup side of insertUser survives; the stale declaration does not
    let insert = engine.records_for("com.x.UserMapper.insertUser")?;
    assert!(insert.code.is_empty());
    assert_eq!(insert.markup.len(), 1);
    Ok(())
}

#[test]
fn test_markup_change_removes_stale_statement() -> Result<()> {
    let temp_dir = create_project(false);
    let root = temp_dir.path();
    let engine = open_engine(root);
    refresh(&engine);

    write(
        root,
        MAPPER_XML_PATH,
        r#"<mapper namespace="com.x.UserMapper"><insert id="insertUser">x</insert></mapper>"#,
    );
    engine.invalidate_file(&root.join(MAPPER_XML_PATH))?;

    let records = engine.records_for("com.x.UserMapper.findById")?;
    assert!(records.markup.is_empty());
    assert_eq!(records.code.len(), 1);
    assert_eq!(records.code[0].file_path, MAPPER_JAVA_PATH);
    Ok(())
}

#[test]
fn test_untracked_paths_are_ignored() -> Result<()> {
    let temp_dir = create_project(false);
    let root = temp_dir.path();
    let engine = open_engine(root);
    write(root, "README.md", "# readme");
    write(root, "target/Gen.java", "class Gen {}");

    assert_eq!(
        engine.invalidate_file(&root.join("README.md"))?,
        InvalidationOutcome::Ignored
    );
    assert_eq!(
        engine.invalidate_file(&root.join("target/Gen.java"))?,
        InvalidationOutcome::Ignored
    );
    assert_eq!(engine.stats().invalidations, 0);
    Ok(())
}

#[test]
fn test_version_is_monotonic() -> Result<()> {
    let temp_dir = create_project(false);
    let root = temp_dir.path();
    let engine = open_engine(root);

    let initial = engine.get_cache_version();
    assert!(engine.is_version_current(initial));

    refresh(&engine);
    let after_refresh = engine.get_cache_version();
    assert!(after_refresh > initial);
    assert!(!engine.is_version_current(initial));

    // A scan with nothing to do leaves the version alone
    engine.periodic_scan()?.unwrap();
    assert_eq!(engine.get_cache_version(), after_refresh);

    engine.invalidate_file(&root.join(MAPPER_XML_PATH))?;
    let after_invalidation = engine.get_cache_version();
    assert!(after_invalidation > after_refresh);
    assert!(engine.is_version_current(after_invalidation));
    assert!(!engine.is_version_current(after_invalidation + 1));
    Ok(())
}

#[test]
fn test_scenario_b_deleted_markup_is_purged_by_scan() -> Result<()> {
    let temp_dir = create_project(false);
    let root = temp_dir.path();
    let engine = open_engine(root);
    refresh(&engine);
    let java_before = engine.store().code_records_for_file(MAPPER_JAVA_PATH)?;

    fs::remove_file(root.join(MAPPER_XML_PATH))?;
    let report = engine.periodic_scan()?.unwrap();
    assert_eq!(report.deleted, 1);
    assert_eq!(report.changed, 0);

    assert!(engine.store().markup_records_for_file(MAPPER_XML_PATH)?.is_empty());
    assert_eq!(engine.store().digest_for(MAPPER_XML_PATH)?, None);
    assert_eq!(
        engine.file_state(&root.join(MAPPER_XML_PATH))?,
        FileState::Unknown
    );

    // The interface was reparsed to the same records
    assert_eq!(
        engine.store().code_records_for_file(MAPPER_JAVA_PATH)?,
        java_before
    );
    assert!(engine.store().digest_for(MAPPER_JAVA_PATH)?.is_some());
    Ok(())
}

#[test]
fn test_scan_picks_up_new_and_changed_files() -> Result<()> {
    let temp_dir = create_project(false);
    let root = temp_dir.path();
    let engine = open_engine(root);
    refresh(&engine);

    write(root, DAO_JAVA_PATH, DAO_JAVA);
    write(
        root,
        MAPPER_XML_PATH,
        &MAPPER_XML.replace("insertUser", "insertAccount"),
    );
    let report = engine.periodic_scan()?.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.changed, 1);
    assert_eq!(report.failed, 0);

    assert_eq!(
        engine
            .records_for("com.x.UserMapper.insertAccount")?
            .markup
            .len(),
        1
    );
    assert!(engine
        .get_logical_ids_for(&root.join(DAO_JAVA_PATH))?
        .contains("com.x.UserMapper.findById"));

    let again = engine.periodic_scan()?.unwrap();
    assert!(!again.has_changes());
    Ok(())
}

/// Counts markup extractions and holds each one long enough for a second
/// request to arrive
struct SlowMarkup {
    inner: MapperXmlExtractor,
    calls: Arc<AtomicUsize>,
}

impl MarkupExtractor for SlowMarkup {
    fn extract_markup(&self, file: &SourceFile) -> Result<Vec<MarkupElementRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(400));
        self.inner.extract_markup(file)
    }
}

#[test]
fn test_scenario_c_concurrent_invalidations_collapse() -> Result<()> {
    let temp_dir = create_project(false);
    let root = temp_dir.path().to_path_buf();
    let config = config_for(&root);

    let calls = Arc::new(AtomicUsize::new(0));
    let mut extractors = Extractors::with_patterns(&[])?;
    extractors.markup = Arc::new(SlowMarkup {
        inner: MapperXmlExtractor::new()?,
        calls: Arc::clone(&calls),
    });
    let store = IndexStore::open(&config.store_path)?;
    let engine = Arc::new(CacheEngine::new(&config, store, extractors)?);
    refresh(&engine);
    calls.store(0, Ordering::SeqCst);

    let xml: PathBuf = root.join(MAPPER_XML_PATH);
    let first = {
        let engine = Arc::clone(&engine);
        let xml = xml.clone();
        std::thread::spawn(move || engine.invalidate_file(&xml))
    };
    std::thread::sleep(Duration::from_millis(100));
    let second = engine.invalidate_file(&xml)?;
    let first = first.join().unwrap()?;

    assert_eq!(second, InvalidationOutcome::Coalesced);
    assert!(matches!(first, InvalidationOutcome::Reparsed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let records = engine.store().markup_records_for_file(MAPPER_XML_PATH)?;
    assert_eq!(records.len(), 3);
    let unique: BTreeSet<&str> = records.iter().map(|r| r.logical_id.as_str()).collect();
    assert_eq!(unique.len(), 3);
    assert_eq!(
        engine.records_for("com.x.UserMapper.findById")?.code.len(),
        1
    );
    Ok(())
}

#[test]
fn test_scenario_d_unreadable_files_are_retried() -> Result<()> {
    let temp_dir = create_project(false);
    let root = temp_dir.path();

    // A directory named like a source file cannot be hashed
    fs::create_dir_all(root.join("Broken.java"))?;
    let good = root.join(MAPPER_JAVA_PATH);
    let digests = compute_digests_parallel(
        &[good.clone(), root.join("Broken.java")],
        &DigestOptions::default(),
    )?;
    assert_eq!(digests.len(), 1);
    assert_eq!(digests[&good], compute_digest(&good)?);
    fs::remove_dir(root.join("Broken.java"))?;

    // A file that cannot be extracted is left without a digest, so every scan retries it
    let bad = "src/main/java/com/x/Bad.java";
    fs::write(root.join(bad), b"cl\xff\xfe")?;
    let engine = open_engine(root);
    let report = engine
        .refresh_all(&LogProgress, &CancellationToken::new())
        .unwrap();
    assert_eq!(report.files_failed, 1);
    assert_eq!(engine.store().digest_for(bad)?, None);
    assert_eq!(engine.file_state(&root.join(bad))?, FileState::Stale);

    let retry = engine.periodic_scan()?.unwrap();
    assert_eq!(retry.added, 1);
    assert_eq!(retry.failed, 1);

    write(root, bad, "package com.x;\npublic class Bad {}\n");
    let fixed = engine.periodic_scan()?.unwrap();
    assert_eq!(fixed.added, 1);
    assert_eq!(fixed.failed, 0);
    assert!(engine.store().digest_for(bad)?.is_some());
    assert_eq!(engine.file_state(&root.join(bad))?, FileState::Fresh);
    Ok(())
}

#[test]
fn test_cancelled_refresh_still_terminates() -> Result<()> {
    let temp_dir = create_project(true);
    let engine = open_engine(temp_dir.path());
    let version = engine.get_cache_version();

    let token = CancellationToken::new();
    token.cancel();
    let report = engine.refresh_all(&LogProgress, &token)?;

    assert!(report.cancelled);
    assert_eq!(report.files_processed, 0);
    assert!(report.summary().contains("cancelled"));
    assert!(engine.get_cache_version() > version);
    Ok(())
}

#[test]
fn test_usage_scope_keeps_declarations() -> Result<()> {
    let temp_dir = create_project(true);
    let engine = open_engine(temp_dir.path());
    refresh(&engine);
    let before = engine.counts()?;

    let report = engine.refresh_scope(RefreshScope::Usage, &LogProgress, &CancellationToken::new())?;
    assert!(report.is_complete());
    assert_eq!(report.files_processed, 2);
    assert_eq!(engine.counts()?, before);
    Ok(())
}

#[test]
fn test_health_advisory_is_one_shot() -> Result<()> {
    let temp_dir = TempDir::new().unwrap();
    let engine = open_engine(temp_dir.path());

    let advisory = engine.run_health_check()?.unwrap();
    assert_eq!(advisory.suggested_scope, RefreshScope::All);
    assert!(engine.run_health_check()?.is_none());

    engine.reset_advisory();
    assert!(engine.run_health_check()?.is_some());

    engine.dismiss_advisory();
    engine
        .refresh_all(&LogProgress, &CancellationToken::new())
        .unwrap();
    assert!(engine.run_health_check()?.is_none());
    Ok(())
}

#[test]
fn test_missing_usages_suggest_usage_scope() -> Result<()> {
    let temp_dir = create_project(false);
    let engine = open_engine(temp_dir.path());
    refresh(&engine);

    let advisory = engine.run_health_check()?.unwrap();
    assert_eq!(advisory.suggested_scope, RefreshScope::Usage);
    Ok(())
}

#[test]
fn test_code_scope_refresh_leaves_no_stale_usages() -> Result<()> {
    let temp_dir = create_project(true);
    let root = temp_dir.path();
    let engine = open_engine(root);
    refresh(&engine);
    let interface_digest = engine.store().digest_for(MAPPER_JAVA_PATH)?;

    let dao = "package com.x.dao;\n\npublic class UserDao {\n}\n";
    write(root, DAO_JAVA_PATH, dao);
    let report =
        engine.refresh_scope(RefreshScope::Code, &LogProgress, &CancellationToken::new())?;
    assert!(report.is_complete());
    assert_eq!(report.files_processed, 2);

    // Declarations were rebuilt but the usages were not, so the DAO stays due
    assert_eq!(engine.store().digest_for(MAPPER_JAVA_PATH)?, interface_digest);
    assert_ne!(
        engine.store().digest_for(DAO_JAVA_PATH)?,
        Some(compute_digest(&root.join(DAO_JAVA_PATH))?)
    );

    let scan = engine.periodic_scan()?.unwrap();
    assert_eq!(scan.changed, 1);
    assert_eq!(engine.counts()?.usages, 0);
    for record in engine.store().code_records_for_file(DAO_JAVA_PATH)? {
        assert_ne!(record.kind, ElementKind::Usage);
        assert!(record.end_offset <= dao.len());
    }
    assert_eq!(engine.records_for("com.x.UserMapper.findById")?.code.len(), 1);
    assert!(!engine.periodic_scan()?.unwrap().has_changes());
    Ok(())
}

#[test]
fn test_markup_scope_refresh_rebuilds_statements() -> Result<()> {
    let temp_dir = create_project(false);
    let root = temp_dir.path();
    let engine = open_engine(root);
    refresh(&engine);

    write(
        root,
        MAPPER_XML_PATH,
        &MAPPER_XML.replace("insertUser", "insertAccount"),
    );
    let report =
        engine.refresh_scope(RefreshScope::Markup, &LogProgress, &CancellationToken::new())?;
    assert!(report.is_complete());
    assert_eq!(report.files_processed, 1);

    let stale = engine.records_for("com.x.UserMapper.insertUser")?;
    assert!(stale.markup.is_empty());
    assert_eq!(stale.code.len(), 1);
    assert_eq!(
        engine
            .records_for("com.x.UserMapper.insertAccount")?
            .markup
            .len(),
        1
    );
    assert_eq!(
        engine.store().digest_for(MAPPER_XML_PATH)?,
        Some(compute_digest(&root.join(MAPPER_XML_PATH))?)
    );
    assert!(!engine.periodic_scan()?.unwrap().has_changes());
    Ok(())
}

/// Cancels its refresh as soon as the given phase starts
struct CancelOnPhase {
    prefix: &'static str,
    token: CancellationToken,
}

impl ProgressSink for CancelOnPhase {
    fn on_progress(&self, _fraction: f64, message: &str) {
        if message.starts_with(self.prefix) {
            self.token.cancel();
        }
    }
}

#[test]
fn test_refresh_cancelled_between_phases_is_repaired_by_scan() -> Result<()> {
    let temp_dir = create_project(true);
    let root = temp_dir.path();
    let engine = open_engine(root);

    let token = CancellationToken::new();
    let sink = CancelOnPhase {
        prefix: "Indexing usage",
        token: token.clone(),
    };
    let report = engine.refresh_all(&sink, &token)?;
    assert!(report.cancelled);
    assert_eq!(report.files_processed, 3);

    // Declarations are in, but the code files are not marked as indexed
    assert_eq!(engine.counts()?.usages, 0);
    assert_eq!(engine.store().digest_for(DAO_JAVA_PATH)?, None);
    assert_eq!(engine.store().digest_for(MAPPER_JAVA_PATH)?, None);
    assert!(engine.store().digest_for(MAPPER_XML_PATH)?.is_some());

    let scan = engine.periodic_scan()?.unwrap();
    assert_eq!(scan.added, 2);
    assert_eq!(scan.failed, 0);
    assert_eq!(engine.counts()?.usages, 1);
    assert_eq!(engine.store().all_digests()?.len(), 3);
    assert_eq!(
        engine.get_files_for(["com.x.UserMapper.findById"])?,
        set(&[DAO_JAVA_PATH, MAPPER_XML_PATH, MAPPER_JAVA_PATH])
    );
    Ok(())
}
