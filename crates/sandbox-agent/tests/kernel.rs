use agent_api_types::Observation;
use sandbox_agent::plugins::{Plugin, PluginContext, PluginError, PythonKernel};
use std::time::Duration;
use tempfile::TempDir;

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

async fn started_kernel(dir: &TempDir) -> PythonKernel {
    let mut kernel = PythonKernel::new("python3").with_cell_timeout(Duration::from_secs(20));
    let ctx = PluginContext {
        work_dir: dir.path().to_path_buf(),
        username: None,
    };
    kernel.initialize(&ctx).await.expect("kernel starts");
    kernel
}

fn code_output(obs: Observation) -> agent_api_types::CodeOutput {
    match obs {
        Observation::CodeOutput(out) => out,
        other => panic!("expected code output, got {other:?}"),
    }
}

#[tokio::test]
async fn state_persists_and_tail_expression_echoes() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let dir = TempDir::new().unwrap();
    let mut kernel = started_kernel(&dir).await;

    let out = code_output(kernel.run_cell("x = 41", dir.path(), None).await.unwrap());
    assert_eq!(out.content, "");
    let out = code_output(kernel.run_cell("print('hi')\nx + 1", dir.path(), None).await.unwrap());
    assert_eq!(out.content, "hi\n42");
    assert_eq!(out.code, "print('hi')\nx + 1");
    kernel.shutdown().await;
}

#[tokio::test]
async fn tracebacks_and_repeated_failures() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let dir = TempDir::new().unwrap();
    let mut kernel = started_kernel(&dir).await;

    let out = code_output(kernel.run_cell("1 / 0", dir.path(), None).await.unwrap());
    assert!(out.content.contains("ZeroDivisionError"));

    let err = kernel.run_cell("1 / 0", dir.path(), None).await.unwrap_err();
    assert!(matches!(err, PluginError::RepeatedFailure));

    let out = code_output(kernel.run_cell("'fixed'", dir.path(), None).await.unwrap());
    assert_eq!(out.content, "'fixed'");
    kernel.shutdown().await;
}

#[tokio::test]
async fn timeout_restarts_kernel_and_loses_state() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let dir = TempDir::new().unwrap();
    let mut kernel = started_kernel(&dir).await;

    kernel.run_cell("marker = 1", dir.path(), None).await.unwrap();
    let err = kernel
        .run_cell(
            "import time\ntime.sleep(30)",
            dir.path(),
            Some(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PluginError::CellTimeout(_)));
    assert!(!kernel.is_running());

    let out = code_output(
        kernel
            .run_cell("'marker' in globals()", dir.path(), None)
            .await
            .unwrap(),
    );
    assert_eq!(out.content, "False");
    kernel.shutdown().await;
}

#[tokio::test]
async fn cells_follow_the_shell_directory() {
    if !python_available() {
        eprintln!("skipping: python3 not found");
        return;
    }
    let dir = TempDir::new().unwrap();
    let sub = dir.path().join("inner");
    std::fs::create_dir(&sub).unwrap();
    let mut kernel = started_kernel(&dir).await;

    let out = code_output(
        kernel
            .run_cell("import os\nos.path.basename(os.getcwd())", &sub, None)
            .await
            .unwrap(),
    );
    assert_eq!(out.content, "'inner'");

    let out = code_output(
        kernel
            .run_cell("%%writefile note.txt\nfrom the kernel", &sub, None)
            .await
            .unwrap(),
    );
    assert_eq!(out.content, "Writing note.txt");
    assert_eq!(
        std::fs::read_to_string(sub.join("note.txt")).unwrap(),
        "from the kernel\n"
    );
    kernel.shutdown().await;
}
