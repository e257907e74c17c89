use rstest::rstest;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::{bind, read_request, write_response, Request, Response};

#[rstest]
fn test_request_wire_format() {
    let request: Request = serde_json::from_str(r#"{"verb": "start", "name": "box"}"#).unwrap();
    assert_eq!(request, Request::Start { name: "box".into() });

    let request: Request = serde_json::from_str(r#"{"verb": "stop", "name": "box"}"#).unwrap();
    assert_eq!(request, Request::Stop { name: "box".into() });

    assert!(serde_json::from_str::<Request>(r#"{"verb": "restart", "name": "box"}"#).is_err());
}

#[rstest]
fn test_response_wire_format() {
    assert_eq!(serde_json::to_string(&Response::Ok).unwrap(), r#"{"status":"ok"}"#);
    assert_eq!(
        serde_json::to_string(&Response::Error {
            message: "no such container: box".into()
        })
        .unwrap(),
        r#"{"status":"error","message":"no such container: box"}"#
    );
}

#[rstest]
fn test_response_from_result() {
    assert_eq!(Response::from_result(&Ok(())), Response::Ok);
    assert_eq!(
        Response::from_result(&Err("boom".into())),
        Response::Error { message: "boom".into() }
    );
}

#[rstest]
#[tokio::test]
async fn test_round_trip_over_socket() {
    let tmpdir = tempfile::Builder::new()
        .prefix("toolboxd-test")
        .tempdir()
        .unwrap();
    let socket = tmpdir.path().join("envd.sock");
    let listener = bind(&socket).unwrap();

    let client = tokio::net::UnixStream::connect(&socket);
    let server = listener.accept();
    let (client, server) = tokio::join!(client, server);
    let mut client = client.unwrap();
    let (server, _) = server.unwrap();

    client
        .write_all(b"{\"verb\": \"start\", \"name\": \"box\"}\n")
        .await
        .unwrap();

    let (request, mut server) = read_request(server).await;
    assert_eq!(request, Some(Request::Start { name: "box".into() }));

    write_response(&mut server, &Response::Ok).await.unwrap();
    let mut line = String::new();
    BufReader::new(client).read_line(&mut line).await.unwrap();
    assert_eq!(line.trim_end(), r#"{"status":"ok"}"#);
}

#[rstest]
#[tokio::test]
async fn test_bind_replaces_stale_socket() {
    let tmpdir = tempfile::Builder::new()
        .prefix("toolboxd-test")
        .tempdir()
        .unwrap();
    let socket = tmpdir.path().join("envd.sock");
    let first = bind(&socket).unwrap();
    drop(first);
    // the leftover socket file must not prevent a fresh bind
    bind(&socket).unwrap();
}

#[rstest]
#[tokio::test]
async fn test_read_request_tolerates_garbage() {
    let tmpdir = tempfile::Builder::new()
        .prefix("toolboxd-test")
        .tempdir()
        .unwrap();
    let socket = tmpdir.path().join("envd.sock");
    let listener = bind(&socket).unwrap();

    let client = tokio::net::UnixStream::connect(&socket);
    let server = listener.accept();
    let (client, server) = tokio::join!(client, server);
    let mut client = client.unwrap();
    let (server, _) = server.unwrap();

    client.write_all(b"not json at all\n").await.unwrap();
    let (request, _stream) = read_request(server).await;
    assert_eq!(request, None);
}
