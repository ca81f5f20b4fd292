//! Worker lifecycle: lifespan, request caps, shutdown, access logging.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use pagi::{app_fn, Config, Event, Scope, SendEvent};

mod support;
use support::*;

fn ok_app() -> impl pagi::Application {
    app_fn(|scope, mut receiver, mut sender| async move {
        match scope {
            Scope::Http(_) => {
                let _ = receiver.next().await?;
                sender
                    .send(SendEvent::response_start(StatusCode::OK, vec![]))
                    .await?;
                sender.send(SendEvent::response_body("ok")).await?;
                Ok(())
            }
            Scope::Lifespan(_) => loop {
                match receiver.next().await? {
                    Event::LifespanStartup => {
                        sender.send(SendEvent::StartupComplete).await?;
                    }
                    Event::LifespanShutdown => {
                        sender.send(SendEvent::ShutdownComplete).await?;
                        return Ok(());
                    }
                    _ => return Ok(()),
                }
            },
            _ => Ok(()),
        }
    })
}

#[tokio::test]
async fn lifespan_startup_failure_aborts_serving() {
    let app = app_fn(|scope, mut receiver, mut sender| async move {
        if let Scope::Lifespan(_) = scope {
            let _ = receiver.next().await?;
            sender
                .send(SendEvent::StartupFailed {
                    message: "no database".into(),
                })
                .await?;
        }
        Ok(())
    });
    let server = serve(Config::new(0), app);
    let err = server.task.await.unwrap().unwrap_err();
    assert!(err.is_lifespan(), "expected lifespan error, got {err:?}");
}

#[tokio::test]
async fn lifespan_events_bracket_serving() {
    let phases = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen = phases.clone();
    let app = app_fn(move |scope, mut receiver, mut sender| {
        let phases = seen.clone();
        async move {
            match scope {
                Scope::Lifespan(_) => loop {
                    match receiver.next().await? {
                        Event::LifespanStartup => {
                            phases.lock().unwrap().push("startup");
                            sender.send(SendEvent::StartupComplete).await?;
                        }
                        Event::LifespanShutdown => {
                            phases.lock().unwrap().push("shutdown");
                            sender.send(SendEvent::ShutdownComplete).await?;
                            return Ok(());
                        }
                        _ => return Ok(()),
                    }
                },
                Scope::Http(_) => {
                    let _ = receiver.next().await?;
                    phases.lock().unwrap().push("request");
                    sender
                        .send(SendEvent::response_start(StatusCode::OK, vec![]))
                        .await?;
                    sender.send(SendEvent::response_body("ok")).await?;
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    });
    let server = serve(Config::new(0), app);
    let mut client = server.connect().await;
    write_all(&mut client, b"GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n").await;
    let _ = read_to_end(&mut client).await;
    server.shutdown().await.unwrap();

    assert_eq!(
        phases.lock().unwrap().as_slice(),
        ["startup", "request", "shutdown"]
    );
}

#[tokio::test]
async fn hooks_bracket_the_worker() {
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let (at_start, at_stop) = (order.clone(), order.clone());
    let bound = pagi::Server::new(Config::new(0))
        .on_startup(move || {
            let order = at_start.clone();
            async move {
                order.lock().unwrap().push("startup");
            }
        })
        .on_shutdown(move || {
            let order = at_stop.clone();
            async move {
                order.lock().unwrap().push("shutdown");
            }
        })
        .bind()
        .unwrap();
    let addr = bound.local_addr();
    let handle = bound.handle();
    let task = tokio::spawn(bound.serve(ok_app()));

    let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
    write_all(
        &mut client,
        b"GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    )
    .await;
    let raw = read_to_end(&mut client).await;
    assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 200 OK\r\n"));

    handle.shutdown();
    task.await.unwrap().unwrap();
    assert_eq!(order.lock().unwrap().as_slice(), ["startup", "shutdown"]);
}

#[tokio::test]
async fn request_cap_recycles_the_worker() {
    let server = serve(Config::new(0).max_requests(3), ok_app());

    for _ in 0..3 {
        let mut client = server.connect().await;
        write_all(
            &mut client,
            b"GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
        )
        .await;
        let raw = read_to_end(&mut client).await;
        assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 200 OK\r\n"));
    }

    // The cap funnels into the graceful-shutdown path on its own.
    let result = tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("worker did not recycle after its cap");
    result.unwrap().unwrap();
}

#[tokio::test]
async fn graceful_shutdown_finishes_in_flight_requests() {
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let release = gate.clone();
    let app = app_fn(move |_scope, mut receiver, mut sender| {
        let gate = release.clone();
        async move {
            let _ = receiver.next().await?;
            // Hold the response until the test has initiated shutdown.
            let _permit = gate.acquire().await.unwrap();
            sender
                .send(SendEvent::response_start(StatusCode::OK, vec![]))
                .await?;
            sender.send(SendEvent::response_body("finished")).await?;
            Ok(())
        }
    });
    let server = serve(Config::new(0), app);
    let mut client = server.connect().await;
    write_all(
        &mut client,
        b"GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let handle = server.handle.clone();
    handle.shutdown();
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.add_permits(1);

    let raw = read_to_end(&mut client).await;
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
    assert!(text.ends_with("finished"), "got: {text}");
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn buffered_access_log_drains_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("access.log");
    let config = Config::new(0)
        .access_log_path(&path)
        .access_log_buffer_size(100)
        .access_log_flush_interval(Duration::ZERO);
    let server = serve(config, ok_app());

    for i in 0..3 {
        let mut client = server.connect().await;
        let request = format!(
            "GET /page/{i}?id={i} HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n"
        );
        write_all(&mut client, request.as_bytes()).await;
        let _ = read_to_end(&mut client).await;
    }

    // Nothing flushed yet: the buffer holds all three entries.
    let so_far = std::fs::read_to_string(&path).unwrap_or_default();
    assert_eq!(so_far, "", "log flushed early: {so_far:?}");

    server.shutdown().await.unwrap();
    let written = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = written.lines().collect();
    assert_eq!(lines.len(), 3, "log: {written:?}");
    for (i, line) in lines.iter().enumerate() {
        assert!(
            line.contains(&format!("\"GET /page/{i}?id={i}\" 200 ")),
            "line: {line}"
        );
        assert!(line.starts_with("127.0.0.1 - - ["), "line: {line}");
    }
}

#[tokio::test]
async fn timed_flush_writes_without_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("access.log");
    let config = Config::new(0)
        .access_log_path(&path)
        .access_log_buffer_size(100)
        .access_log_flush_interval(Duration::from_millis(100));
    let server = serve(config, ok_app());

    let mut client = server.connect().await;
    write_all(
        &mut client,
        b"GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    )
    .await;
    let _ = read_to_end(&mut client).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let written = std::fs::read_to_string(&path).unwrap();
    assert_eq!(written.lines().count(), 1, "log: {written:?}");
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn drain_closes_idle_keep_alive_connections() {
    let server = serve(Config::new(0), ok_app());
    let mut client = server.connect().await;

    write_all(&mut client, b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").await;
    let head = read_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    let _body = read_exact(&mut client, 2).await;

    // The connection idles in keep-alive; shutdown must not hang on it.
    let shutdown = tokio::time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .expect("shutdown hung on idle connection");
    shutdown.unwrap();
    let rest = read_to_end(&mut client).await;
    assert!(rest.is_empty(), "unexpected bytes at close: {rest:?}");
}

#[tokio::test]
async fn conversations_count_once_toward_the_cap() {
    let served = Arc::new(AtomicUsize::new(0));
    let counter = served.clone();
    let app = app_fn(move |_scope, mut receiver, mut sender| {
        let served = counter.clone();
        async move {
            let _ = receiver.next().await?;
            served.fetch_add(1, Ordering::SeqCst);
            sender
                .send(SendEvent::response_start(StatusCode::OK, vec![]))
                .await?;
            sender.send(SendEvent::response_body("ok")).await?;
            Ok(())
        }
    });
    let server = serve(Config::new(0).max_requests(2), app);

    // Two keep-alive requests on one connection reach the cap.
    let mut client = server.connect().await;
    write_all(&mut client, b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").await;
    let _ = read_head(&mut client).await;
    let _ = read_exact(&mut client, 2).await;
    write_all(&mut client, b"GET / HTTP/1.1\r\nHost: t\r\n\r\n").await;
    let _ = read_head(&mut client).await;
    let _ = read_exact(&mut client, 2).await;

    tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("worker did not stop at cap")
        .unwrap()
        .unwrap();
    assert_eq!(served.load(Ordering::SeqCst), 2);
}
