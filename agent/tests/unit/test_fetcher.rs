//! Source fetcher tests

use std::sync::Arc;

use tagflash::deploy::git::{GitOptions, SourceFetcher};
use tagflash::errors::FetchError;

use crate::support::{exit, stdout, FakeWorld, ScriptedRunner, REPO_URL};

const COMMIT: &str = "9fceb02d0ae598e95dc970b74767f19372d61af8";

#[tokio::test]
async fn test_fetch_pins_checkout_to_resolved_commit() {
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("blink");
    let world = Arc::new(FakeWorld::with_tags(&[("v1.2.3", COMMIT)]));
    let runner = ScriptedRunner::new({
        let world = world.clone();
        move |spec| world.handle(spec)
    });

    let fetcher = SourceFetcher::new(runner.clone(), GitOptions::default());
    let workspace = fetcher.fetch(REPO_URL, "v1.2.3", &dest).await.unwrap();

    assert_eq!(workspace.path(), dest.as_path());
    assert_eq!(workspace.reference(), "v1.2.3");
    assert_eq!(workspace.commit(), COMMIT);

    let dest_arg = dest.to_string_lossy().into_owned();
    let dest_arg = dest_arg.as_str();
    let args: Vec<Vec<String>> = runner.calls().into_iter().map(|c| c.args).collect();
    let expected: Vec<Vec<&str>> = vec![
        vec!["clone", "--no-checkout", "--quiet", "--", REPO_URL, dest_arg],
        vec!["-C", dest_arg, "rev-parse", "--verify", "--quiet", "refs/tags/v1.2.3^{commit}"],
        vec!["-C", dest_arg, "checkout", "--detach", "--quiet", COMMIT],
        vec!["-C", dest_arg, "rev-parse", "HEAD"],
    ];
    assert_eq!(args, expected);
}

#[tokio::test]
async fn test_fetch_unknown_tag() {
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("blink");
    let world = Arc::new(FakeWorld::with_tags(&[("v1.0.0", COMMIT)]));
    let runner = ScriptedRunner::new(move |spec| world.handle(spec));

    let err = SourceFetcher::new(runner.clone(), GitOptions::default())
        .fetch(REPO_URL, "v9.9.9", &dest)
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::RefNotFound { ref reference, .. } if reference == "v9.9.9"));
    // The clone is left for the caller to clean up
    assert!(dest.exists());
    assert_eq!(runner.calls().len(), 2);
}

#[tokio::test]
async fn test_fetch_clone_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new(|_| {
        Ok(tagflash::deploy::command::CommandOutput {
            code: Some(128),
            stdout: Vec::new(),
            stderr: b"fatal: repository 'https://git.example.com/acme/blink.git/' not found\n".to_vec(),
        })
    });

    let err = SourceFetcher::new(runner, GitOptions::default())
        .fetch(REPO_URL, "v1.2.3", &tmp.path().join("blink"))
        .await
        .unwrap_err();

    match err {
        FetchError::Clone { url, reason } => {
            assert_eq!(url, REPO_URL);
            assert!(reason.contains("not found"), "{}", reason);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_fetch_detects_head_mismatch() {
    let tmp = tempfile::tempdir().unwrap();
    let dest = tmp.path().join("blink");
    let runner = ScriptedRunner::new(|spec| {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        Ok(match args.as_slice() {
            ["clone", ..] => exit(0),
            [.., "rev-parse", "HEAD"] => stdout("0000000000000000000000000000000000000000\n"),
            [.., "rev-parse", "--verify", "--quiet", _] => stdout(&format!("{}\n", COMMIT)),
            _ => exit(0),
        })
    });

    let err = SourceFetcher::new(runner, GitOptions::default())
        .fetch(REPO_URL, "v1.2.3", &dest)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Checkout { ref commit, .. } if commit == COMMIT));
}

#[tokio::test]
async fn test_fetch_refuses_existing_destination_and_bad_names() {
    let tmp = tempfile::tempdir().unwrap();
    let runner = ScriptedRunner::new(|_| Ok(exit(0)));
    let fetcher = SourceFetcher::new(runner.clone(), GitOptions::default());

    let err = fetcher.fetch(REPO_URL, "v1.2.3", tmp.path()).await.unwrap_err();
    assert!(matches!(err, FetchError::Clone { .. }));

    let err = fetcher
        .fetch(REPO_URL, "--upload-pack=touch /tmp/x", &tmp.path().join("blink"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::RefNotFound { .. }));

    assert!(runner.calls().is_empty());
}
