//! RPC calls over a real TCP connection to a running daemon.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::tempdir;

use ccd_exposed::config::ExposedConfig;
use ccd_exposed::controller::ExposureInfo;
use ccd_exposed::rpc::Response;
use ccd_exposed::server::RpcClient;
use ccd_exposed::state::{AbortLevel, ExposureState};
use ccd_exposed::Daemon;

fn config(dir: &Path, allowed: &str) -> ExposedConfig {
    let toml = format!(
        r#"
        [exposed]
        instrument = "OES"
        instrument_prefix = "o"
        listen = "127.0.0.1:0"
        allowed_ips = [{allowed}]

        [paths]
        output = ["{}"]

        [ccd]
        readout_time = 0
        x2 = 16
        y2 = 16
        "#,
        dir.display()
    );
    ExposedConfig::from_toml_str(&toml).unwrap()
}

fn result_str(response: &Response) -> &str {
    response
        .as_str()
        .unwrap_or_else(|| panic!("expected a string result, got {response:?}"))
}

#[tokio::test]
async fn test_exposure_over_tcp() {
    let dir = tempdir().unwrap();
    let daemon = Daemon::start(config(dir.path(), r#""127.0.0.1""#)).await.unwrap();
    let mut client = RpcClient::connect(daemon.local_addr()).await.unwrap();

    let reply = client
        .call("expose_set_key", vec![json!("IMAGETYP"), json!("zero")])
        .await
        .unwrap();
    assert!(result_str(&reply).starts_with("+OK IMAGETYP = zero"));

    let reply = client
        .call("expose_start", vec![json!(0), json!(1), json!(-1)])
        .await
        .unwrap();
    assert_eq!(result_str(&reply), "+OK EXPOSE 0 1 -1");

    let mut info: Option<ExposureInfo> = None;
    for _ in 0..250 {
        let Response::Result(value) = client.call("expose_info", vec![]).await.unwrap() else {
            panic!("expose_info faulted");
        };
        let current: ExposureInfo = serde_json::from_value(value).unwrap();
        if current.state == "ready" && !current.filename.is_empty() {
            info = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let info = info.expect("batch finished");
    assert!(info.filename.starts_with('o'));
    assert!(info.filename.ends_with("0001.fit"));
    assert!(dir.path().join(&info.filename).exists());

    let reply = client.call("expose_get", vec![json!("MESSAGE 1")]).await.unwrap();
    assert!(result_str(&reply).contains("ccd is ready"));

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_many_calls_on_one_connection() {
    let dir = tempdir().unwrap();
    let daemon = Daemon::start(config(dir.path(), r#""127.0.0.1""#)).await.unwrap();
    let mut client = RpcClient::connect(daemon.local_addr()).await.unwrap();

    for object in ["Vega", "Deneb", "Altair"] {
        let reply = client
            .call("expose_set_key", vec![json!("OBJECT"), json!(object)])
            .await
            .unwrap();
        assert_eq!(
            result_str(&reply),
            format!("+OK OBJECT = {object} / Title of observation")
        );
    }

    let reply = client.call("expose_get_key", vec![json!("OBJECT")]).await.unwrap();
    assert_eq!(result_str(&reply), "+OK OBJECT = Altair / Title of observation");

    let reply = client.call("expose_levitate", vec![]).await.unwrap();
    assert_eq!(reply.fault().unwrap().code, 3);

    // A fault does not close the connection.
    let reply = client.call("expose_get", vec![json!("INSTRUMENT")]).await.unwrap();
    assert_eq!(result_str(&reply), "+OK INSTRUMENT = OES");

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_denied_client_has_no_effect() {
    let dir = tempdir().unwrap();
    let daemon = Daemon::start(config(dir.path(), r#""10.1.2.3""#)).await.unwrap();
    let mut client = RpcClient::connect(daemon.local_addr()).await.unwrap();

    for (method, params) in [
        ("expose_set_key", vec![json!("IMAGETYP"), json!("flat")]),
        ("expose_start", vec![json!(1), json!(1), json!(-1)]),
        ("expose_abort", Vec::<Value>::new()),
    ] {
        let reply = client.call(method, params).await.unwrap();
        let fault = reply.fault().expect("denied");
        assert_eq!(fault.code, 1);
        assert_eq!(fault.message, "Connection from 127.0.0.1 denied");
    }

    let shared = daemon.controller().shared();
    assert_eq!(shared.state(), ExposureState::Ready);
    assert_eq!(shared.abort_level(), AbortLevel::None);
    assert!(shared.descriptor().image_type.is_none());
    assert!(shared.with(|s| s.messages.is_empty()));

    daemon.shutdown().await;
}
