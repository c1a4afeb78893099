// Runs ProcessEngine against /bin/sh; the "scene file" is a shell script and
// sees the engine arguments as positional parameters.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use render_job_engine::engine::error::PipelineError;
use render_job_engine::engine::invoker::{EngineLog, Invocation, ProcessEngine, SceneEngine};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

#[tokio::test]
async fn test_output_is_captured_in_log() {
    let dir = tempfile::tempdir().unwrap();
    let scene = write_script(
        dir.path(),
        "scene.sh",
        "echo \"args: $*\"\necho 'warning: low light' >&2\n",
    );
    let log = EngineLog::create(&dir.path().join("logs/1.log")).await.unwrap();
    let engine = ProcessEngine::new("/bin/sh");

    engine.check_available().await.unwrap();
    engine
        .invoke(
            &Invocation::base(&scene, Path::new("/tools/Scene.py"), Path::new("/ws/config.json")),
            &log,
        )
        .await
        .unwrap();

    let lines = log.tail(usize::MAX);
    assert!(lines.contains(&"args: -b -P /tools/Scene.py -- -i /ws/config.json".to_string()));
    assert!(lines.contains(&"warning: low light".to_string()));
    let on_disk = std::fs::read_to_string(log.path()).unwrap();
    assert!(on_disk.contains("warning: low light"));
}

#[tokio::test]
async fn test_nonzero_exit_is_an_error_with_tail() {
    let dir = tempfile::tempdir().unwrap();
    let scene = write_script(
        dir.path(),
        "scene.sh",
        "echo 'loading scene'\necho 'Error: missing object' >&2\nexit 3\n",
    );
    let log = EngineLog::create(&dir.path().join("2.log")).await.unwrap();
    let engine = ProcessEngine::new("/bin/sh");

    let err = engine
        .invoke(&Invocation::pass(&scene, Path::new("/tools/Mirror.py")), &log)
        .await
        .unwrap_err();

    match err {
        PipelineError::EngineExit {
            script,
            code,
            log: log_path,
            output_tail,
        } => {
            assert_eq!(script, PathBuf::from("/tools/Mirror.py"));
            assert_eq!(code, Some(3));
            assert_eq!(log_path, dir.path().join("2.log"));
            assert!(output_tail.contains(&"Error: missing object".to_string()));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_log_accumulates_across_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let base = write_script(dir.path(), "base.sh", "echo base\n");
    let pass = write_script(dir.path(), "pass.sh", "echo pass\n");
    let log = EngineLog::create(&dir.path().join("3.log")).await.unwrap();
    let engine = ProcessEngine::new("/bin/sh");

    engine
        .invoke(&Invocation::pass(&base, Path::new("a.py")), &log)
        .await
        .unwrap();
    engine
        .invoke(&Invocation::pass(&pass, Path::new("b.py")), &log)
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(log.path()).unwrap(),
        "base\npass\n"
    );
}

#[tokio::test]
async fn test_non_utf8_output_does_not_stall_engine() {
    let dir = tempfile::tempdir().unwrap();
    // An undecodable path, then far more output than a pipe buffer holds.
    let scene = write_script(
        dir.path(),
        "scene.sh",
        "printf 'Read blend: /tmp/caf\\351.blend\\n'\n\
         head -c 1048576 /dev/zero | tr '\\0' 'a'\n\
         printf '\\ndone\\n'\n\
         printf 'w\\377rn\\n' >&2\n",
    );
    let log = EngineLog::create(&dir.path().join("5.log")).await.unwrap();
    let engine = ProcessEngine::new("/bin/sh");

    tokio::time::timeout(
        Duration::from_secs(30),
        engine.invoke(&Invocation::pass(&scene, Path::new("a.py")), &log),
    )
    .await
    .expect("engine run stalled")
    .unwrap();

    let tail = log.tail(usize::MAX);
    assert!(tail.contains(&"done".to_string()));
    let on_disk = std::fs::read(log.path()).unwrap();
    let text = String::from_utf8(on_disk).unwrap();
    assert!(text.starts_with("Read blend: /tmp/caf\u{FFFD}.blend\n"));
    assert!(text.contains("w\u{FFFD}rn\n"));
    assert!(text.len() > 1024 * 1024);
}

#[tokio::test]
async fn test_unspawnable_engine_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let log = EngineLog::create(&dir.path().join("4.log")).await.unwrap();
    let engine = ProcessEngine::new(dir.path().join("no-such-engine"));

    let err = engine
        .invoke(&Invocation::pass(Path::new("x.blend"), Path::new("y.py")), &log)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::EngineMissing(_)));
}
