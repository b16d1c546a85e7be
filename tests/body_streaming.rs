// Request bodies arriving in chunks and response bodies written through a channel
#[cfg(test)]
mod test {
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{HeaderValue, Method, StatusCode, header};
    use serde::Deserialize;
    use streamgate::{
        adapters::standard_codecs,
        core::{CompositeBuffer, HttpError, Request, ResponseBody, StreamingBody},
        ports::{BufferedChannel, TransportError},
        reactive::Flo,
    };

    #[derive(Debug, Deserialize, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_size_cap_rejects_the_crossing_chunk_and_everything_after() {
        let body = StreamingBody::new(10);
        body.append(Bytes::from_static(b"12345"), false).unwrap();
        body.append(Bytes::from_static(b"12345"), false).unwrap();

        let crossing = body.append(Bytes::from_static(b"1"), false).unwrap_err();
        assert_eq!(crossing.status, StatusCode::PAYLOAD_TOO_LARGE);

        let after = body.append(Bytes::from_static(b"x"), true).unwrap_err();
        assert_eq!(after.status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body.received(), 11);
    }

    #[tokio::test]
    async fn test_whole_body_waits_for_the_last_chunk() {
        let body = Arc::new(StreamingBody::new(1024));
        let reader = {
            let body = body.clone();
            tokio::spawn(async move { body.text().await })
        };

        body.append(Bytes::from_static(b"hello "), false).unwrap();
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());
        body.append(Bytes::from_static(b"world"), true).unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), "hello world");
    }

    #[tokio::test]
    async fn test_json_is_parsed_as_chunks_arrive() {
        let body = Arc::new(StreamingBody::new(1024));
        let request = Request::parse(Method::POST, "/points")
            .unwrap()
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .with_body(body.clone());

        let codecs = standard_codecs();
        let read = tokio::spawn(async move { codecs.read::<Point>(&request).await });

        body.append(Bytes::from_static(br#"{"x": 1,"#), false).unwrap();
        body.append(Bytes::from_static(br#" "y": -2}"#), false).unwrap();
        tokio::task::yield_now().await;
        // complete object, but more bytes may still follow
        assert!(!read.is_finished());

        body.append(Bytes::from_static(b"\n"), true).unwrap();
        let point = read.await.unwrap().unwrap();
        assert_eq!(point, Point { x: 1, y: -2 });
    }

    #[tokio::test]
    async fn test_json_trailing_data_is_rejected_however_it_is_chunked() {
        let splits: [&[&[u8]]; 3] = [
            &[b"[1] garbage"],
            &[b"[1]", b" garbage"],
            &[b"[1] ", b"", b"g"],
        ];
        for chunks in splits {
            let body = Arc::new(StreamingBody::new(1024));
            let request = Request::parse(Method::POST, "/points")
                .unwrap()
                .with_body(body.clone());
            let codecs = standard_codecs();
            let read = tokio::spawn(async move { codecs.read::<Vec<u8>>(&request).await });

            for chunk in chunks {
                body.append(Bytes::copy_from_slice(chunk), false).unwrap();
                tokio::task::yield_now().await;
            }
            body.append(Bytes::new(), true).unwrap();

            let error = read.await.unwrap().unwrap_err();
            assert_eq!(error.status, StatusCode::BAD_REQUEST, "chunks {chunks:?}");
        }
    }

    #[tokio::test]
    async fn test_failing_and_panicking_readers_fail_the_body() {
        let body = StreamingBody::new(64);
        let pending = body
            .read_async(|buffer: &mut CompositeBuffer, _| {
                if buffer.to_bytes().starts_with(b"bad") {
                    return Err(HttpError::bad_request("rejected by reader"));
                }
                Ok::<Option<()>, HttpError>(None)
            })
            .unwrap();
        body.append(Bytes::from_static(b"bad"), false).unwrap();
        assert_eq!(pending.await.unwrap_err().status, StatusCode::BAD_REQUEST);
        // a reader's own rejection leaves the body itself readable
        body.append(Bytes::from_static(b"!"), true).unwrap();
        assert_eq!(body.text().await.unwrap(), "bad!");

        let body = Arc::new(StreamingBody::new(64));
        let waiter = {
            let body = body.clone();
            tokio::spawn(async move { body.bytes().await })
        };
        let pending = body
            .read_async(|_: &mut CompositeBuffer, last| -> Result<Option<()>, HttpError> {
                if last {
                    panic!("reader bug at end of body");
                }
                Ok(None)
            })
            .unwrap();
        body.append(Bytes::from_static(b"data"), false).unwrap();
        let error = body.append(Bytes::new(), true).unwrap_err();
        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);

        let timeout = std::time::Duration::from_secs(2);
        let read = tokio::time::timeout(timeout, pending).await.unwrap();
        assert_eq!(read.unwrap_err().status, StatusCode::INTERNAL_SERVER_ERROR);
        let whole = tokio::time::timeout(timeout, waiter).await.unwrap().unwrap();
        assert_eq!(whole.unwrap_err().status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_oversized_json_body_fails_the_read() {
        let body = Arc::new(StreamingBody::new(8));
        let request = Request::parse(Method::POST, "/points")
            .unwrap()
            .with_body(body.clone());

        let codecs = standard_codecs();
        let read = tokio::spawn(async move { codecs.read::<Point>(&request).await });

        body.append(Bytes::from_static(br#"{"x": 100000,"#), false)
            .unwrap_err();

        let error = read.await.unwrap().unwrap_err();
        assert_eq!(error.status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_stream_body_writes_every_chunk_in_order() {
        let chunks = Flo::from_iter(0..50u32).map(|n| Bytes::from(format!("{n};")));
        let body = ResponseBody::stream(chunks.into_publisher());

        let mut channel = BufferedChannel::new();
        let written = body.write_to(&mut channel).await.unwrap();

        let expected: String = (0..50).map(|n| format!("{n};")).collect();
        assert_eq!(written, expected.len() as u64);
        assert_eq!(String::from_utf8(channel.concat()).unwrap(), expected);
        assert!(channel.flushes >= 1);
    }

    #[tokio::test]
    async fn test_file_body_stays_inside_its_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("public");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::write(dir.path().join("secret.txt"), "nope").unwrap();

        let mut channel = BufferedChannel::new();
        let written = ResponseBody::file(&root, "index.html")
            .write_to(&mut channel)
            .await
            .unwrap();
        assert_eq!(written, 11);
        assert_eq!(channel.concat(), b"<h1>hi</h1>");

        let mut channel = BufferedChannel::new();
        let escaped = ResponseBody::file(&root, "../secret.txt")
            .write_to(&mut channel)
            .await
            .unwrap_err();
        assert!(matches!(escaped, TransportError::PathTraversal(_)));
        assert!(channel.chunks.is_empty());

        let missing = ResponseBody::file(&root, "missing.html")
            .write_to(&mut BufferedChannel::new())
            .await
            .unwrap_err();
        assert!(matches!(missing, TransportError::NotFound(_)));
    }
}
