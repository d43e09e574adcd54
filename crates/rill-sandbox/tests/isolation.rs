use std::time::Duration;

use rill_sandbox::{native, ProviderKind, RuntimeOptions, SandboxError, SandboxProvider};
use serde_json::json;

fn options() -> RuntimeOptions {
    RuntimeOptions::default().with_timeout(Duration::from_millis(500))
}

#[test]
fn test_contexts_do_not_share_globals() {
    for kind in [ProviderKind::QuickJs, ProviderKind::Worker] {
        let rt = SandboxProvider::from_kind(kind).create_runtime(options()).unwrap();
        let a = rt.create_context().unwrap();
        let b = rt.create_context().unwrap();

        a.eval("globalThis.secret = 'a'").unwrap();
        assert_eq!(b.eval("typeof secret").unwrap(), json!("undefined"), "{kind}");
        rt.dispose();
    }
}

#[test]
fn test_disposed_context_releases_globals() {
    let rt = SandboxProvider::from_kind(ProviderKind::QuickJs)
        .create_runtime(options())
        .unwrap();
    let ctx = rt.create_context().unwrap();
    ctx.define_function("hostAdd", native(|args| Ok(json!(args.len()))))
        .unwrap();
    ctx.dispose();
    ctx.dispose();

    assert!(ctx.is_disposed());
    assert_eq!(ctx.get_global("hostAdd"), Err(SandboxError::Disposed));
    // The runtime itself survives its contexts.
    assert!(rt.create_context().is_ok());
}

#[test]
fn test_console_reaches_host_sink() {
    let rt = SandboxProvider::default().create_runtime(options()).unwrap();
    let ctx = rt.create_context().unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    ctx.define_function(
        "__rill_log",
        native(move |args| {
            let _ = tx.lock().unwrap().send(args);
            Ok(json!(null))
        }),
    )
    .unwrap();

    ctx.eval("console.warn('low disk', {free: 3})").unwrap();
    let args = rx.try_recv().unwrap();
    assert_eq!(args, vec![json!("warn"), json!("low disk {\"free\":3}")]);
}

#[test]
fn test_runaway_code_is_stopped_on_every_guarded_provider() {
    for kind in [ProviderKind::QuickJs, ProviderKind::Worker] {
        let rt = SandboxProvider::from_kind(kind)
            .create_runtime(RuntimeOptions::default().with_timeout(Duration::from_millis(50)))
            .unwrap();
        let ctx = rt.create_context().unwrap();
        let err = ctx.eval("while (true) {}").unwrap_err();
        assert!(err.is_timeout(), "{kind}: {err:?}");
        rt.dispose();
    }
}
