mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{StatusCode, header};
use axum::routing::get;
use bytes::Bytes;
use common::png;
use futures::StreamExt;
use photo_pipeline::cache::disk::ByteStore;
use photo_pipeline::cache::key::{HashMode, KeyHasher};
use photo_pipeline::config::{DiskCacheConfig, DiskFormat, HttpConfig};
use photo_pipeline::errors::ErrorKind;
use photo_pipeline::fetcher::{FetchOrigin, FetchRequest, Fetcher, HttpImageSource, ImageSource};
use photo_pipeline::listing::fetch_listing;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn router() -> Router {
    let image = png(32, 16);
    Router::new()
        .route(
            "/a.png",
            get(move || {
                let body = image.clone();
                async move { ([(header::CONTENT_TYPE, "image/png")], body) }
            }),
        )
        .route(
            "/chunked",
            get(|| async {
                let chunks = ["first-", "second-", "third"]
                    .into_iter()
                    .map(|s| Ok::<_, std::io::Error>(Bytes::from_static(s.as_bytes())));
                Body::from_stream(futures::stream::iter(chunks))
            }),
        )
        .route(
            "/stalled",
            get(|| async {
                let first = futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(
                    b"partial",
                ))]);
                Body::from_stream(first.chain(futures::stream::pending()))
            }),
        )
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .route(
            "/listing.json",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "application/json")],
                    r#"[{"image":{"url":"http://x/1.jpg"}},{"image":{"url":"http://x/2.jpg"}}]"#,
                )
            }),
        )
}

fn source() -> HttpImageSource {
    HttpImageSource::new(&HttpConfig::default()).unwrap()
}

#[tokio::test]
async fn test_fetch_with_content_length() {
    let addr = serve(router()).await;
    let bytes = source()
        .fetch(&format!("http://{addr}/a.png"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(&bytes[..], &png(32, 16)[..]);
}

#[tokio::test]
async fn test_fetch_chunked_body_grows_buffer() {
    let addr = serve(router()).await;
    let bytes = source()
        .fetch(&format!("http://{addr}/chunked"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"first-second-third");
}

#[tokio::test]
async fn test_http_error_status() {
    let addr = serve(router()).await;
    let err = source()
        .fetch(&format!("http://{addr}/missing"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransientIo);
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn test_cancel_mid_body() {
    let addr = serve(router()).await;
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            source()
                .fetch(&format!("http://{addr}/stalled"), &cancel)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.unwrap_err().is_cancelled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fetcher_persists_network_result() {
    let addr = serve(router()).await;
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(ByteStore::new(DiskCacheConfig {
        directory: dir.path().join("cache"),
        format: DiskFormat::Deflate,
        ..DiskCacheConfig::default()
    }));
    disk.initialize();
    let fetcher = Fetcher::new(Arc::clone(&disk), Arc::new(source()));

    let url = format!("http://{addr}/a.png");
    let request = FetchRequest {
        identifier: url.clone(),
        key: KeyHasher::new(HashMode::Md5).hash(&url),
        attached: None,
        disk_cache: true,
    };

    let fetched = fetcher
        .resolve(request.clone(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fetched.origin, FetchOrigin::Network);

    let again = fetcher
        .resolve(request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(again.origin, FetchOrigin::Disk);
    assert_eq!(again.bytes, fetched.bytes);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_transfer_is_not_persisted() {
    let addr = serve(router()).await;
    let dir = TempDir::new().unwrap();
    let disk = Arc::new(ByteStore::new(DiskCacheConfig {
        directory: dir.path().join("cache"),
        format: DiskFormat::Raw,
        ..DiskCacheConfig::default()
    }));
    disk.initialize();
    let fetcher = Arc::new(Fetcher::new(Arc::clone(&disk), Arc::new(source())));

    let url = format!("http://{addr}/stalled");
    let key = KeyHasher::new(HashMode::Md5).hash(&url);
    let request = FetchRequest {
        identifier: url,
        key: key.clone(),
        attached: None,
        disk_cache: true,
    };
    let cancel = CancellationToken::new();
    let task = {
        let fetcher = Arc::clone(&fetcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { fetcher.resolve(request, &cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(!disk.contains(&key));
}

#[tokio::test]
async fn test_fetch_listing() {
    let addr = serve(router()).await;
    let source = source();
    let urls = fetch_listing(source.client(), &format!("http://{addr}/listing.json"))
        .await
        .unwrap();
    assert_eq!(urls, vec!["http://x/1.jpg", "http://x/2.jpg"]);
}
