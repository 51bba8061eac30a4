// Integration tests for the WebSocket detection server
//
// These tests verify that:
// 1. Every binary frame gets exactly one JSON response, in request order
// 2. Decode and detection failures are reported without closing the connection
// 3. Oversized frames are rejected before reaching the pipeline
// 4. The active connection registry returns to baseline after disconnects
// 5. Cancelling the shutdown token stops the accept loop
//
// A scripted detector stands in for the model: it reports the dominant colour
// of the frame and sleeps on wide frames to simulate a slow inference.

use std::{
  io::Cursor,
  net::{Ipv4Addr, SocketAddr},
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
  time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use guanfeng::{
  config::ServerConfig,
  frame::{AsNhwcFrame, DecodedFrame},
  input::{DecodeError, FrameDecoder, ImageDecoder},
  model::{DetectItem, DetectResult, Detector},
  protocol::{Response, Status},
  server::{ConnectionRegistry, Server, ServerError},
};
use image::{ImageFormat, Rgb, RgbImage};
use tokio::{net::TcpStream, task::JoinHandle, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);
const SLOW_WIDTH: u32 = 64;

#[derive(Debug, thiserror::Error)]
#[error("scripted detector failure")]
struct ScriptedFailure;

/// Reports one box labelled with the dominant channel of the first pixel.
/// Black frames have no objects; a pure white frame makes the model fail.
struct ColourDetector;

impl Detector for ColourDetector {
  type Error = ScriptedFailure;

  fn infer(&self, frame: &DecodedFrame) -> Result<DetectResult, Self::Error> {
    if frame.width() as u32 == SLOW_WIDTH {
      std::thread::sleep(Duration::from_millis(300));
    }

    let pixel = &frame.as_nhwc()[..3];
    if pixel == [255, 255, 255] {
      return Err(ScriptedFailure);
    }
    let (class_id, value) = pixel
      .iter()
      .enumerate()
      .max_by_key(|(_, value)| **value)
      .map(|(i, value)| (i as u32, *value))
      .unwrap_or((0, 0));
    if value == 0 {
      return Ok(DetectResult::default());
    }

    Ok(DetectResult::from(vec![DetectItem {
      class_id,
      score: value as f32 / 255.0,
      bbox: [0.25, 0.25, 0.75, 0.5],
    }]))
  }

  fn labels(&self) -> &[&str] {
    &["red", "green", "blue"]
  }
}

struct CountingDecoder {
  calls: Arc<AtomicUsize>,
}

impl FrameDecoder for CountingDecoder {
  type Error = DecodeError;

  fn decode(&self, bytes: &[u8]) -> Result<DecodedFrame, Self::Error> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    ImageDecoder.decode(bytes)
  }
}

struct TestServer {
  addr: SocketAddr,
  registry: ConnectionRegistry,
  decoded: Arc<AtomicUsize>,
  shutdown: CancellationToken,
  task: JoinHandle<()>,
}

impl TestServer {
  async fn start() -> Self {
    Self::with_config(local_config()).await
  }

  async fn with_config(config: ServerConfig) -> Self {
    let decoded = Arc::new(AtomicUsize::new(0));
    let decoder = CountingDecoder {
      calls: Arc::clone(&decoded),
    };
    let server = Server::bind(config, ColourDetector, decoder).await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(server.run(shutdown.clone()));

    Self {
      addr,
      registry,
      decoded,
      shutdown,
      task,
    }
  }

  async fn connect(&self) -> Client {
    let (client, _) = connect_async(format!("ws://{}", self.addr)).await.unwrap();
    client
  }

  async fn wait_for_connections(&self, expected: usize) {
    let mut count = self.registry.subscribe();
    timeout(WAIT, count.wait_for(|n| *n == expected))
      .await
      .expect("connection count did not settle")
      .unwrap();
  }

  async fn stop(self) {
    self.shutdown.cancel();
    timeout(WAIT, self.task).await.unwrap().unwrap();
  }
}

fn local_config() -> ServerConfig {
  ServerConfig::default()
    .with_bind_address(Ipv4Addr::LOCALHOST.into())
    .with_port(0)
    .with_inference_workers(2)
}

fn png(width: u32, color: [u8; 3]) -> Vec<u8> {
  let mut bytes = Vec::new();
  RgbImage::from_pixel(width, 8, Rgb(color))
    .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
    .unwrap();
  bytes
}

async fn next_response(client: &mut Client) -> Response {
  loop {
    let message = timeout(WAIT, client.next())
      .await
      .expect("no response in time")
      .expect("connection closed")
      .unwrap();
    match message {
      Message::Text(text) => return serde_json::from_str(&text).unwrap(),
      Message::Ping(_) | Message::Pong(_) => continue,
      other => panic!("unexpected message: {:?}", other),
    }
  }
}

async fn request(client: &mut Client, frame: Vec<u8>) -> Response {
  client.send(Message::Binary(frame)).await.unwrap();
  next_response(client).await
}

#[tokio::test]
async fn empty_scene_is_an_empty_success() {
  let server = TestServer::start().await;
  let mut client = server.connect().await;

  let response = request(&mut client, png(8, [0, 0, 0])).await;
  assert_eq!(response.status, Status::Success);
  assert!(response.detections.is_empty());
  assert!(response.inference_time.unwrap() >= 0.0);
  assert!(response.message.is_none());

  server.stop().await;
}

#[tokio::test]
async fn detections_are_mapped_to_origin_and_size() {
  let server = TestServer::start().await;
  let mut client = server.connect().await;

  let response = request(&mut client, png(8, [0, 0, 255])).await;
  assert_eq!(response.status, Status::Success);
  assert_eq!(response.detections.len(), 1);

  let detection = &response.detections[0];
  assert_eq!(detection.label, "blue");
  assert_eq!(detection.confidence, 1.0);
  assert_eq!((detection.x, detection.y), (0.25, 0.25));
  assert_eq!((detection.width, detection.height), (0.5, 0.25));

  server.stop().await;
}

#[tokio::test]
async fn failures_are_reported_and_the_connection_stays_usable() {
  let server = TestServer::start().await;
  let mut client = server.connect().await;

  let truncated = png(8, [10, 20, 30])[..16].to_vec();
  for frame in [Vec::new(), truncated, png(8, [255, 255, 255])] {
    let response = request(&mut client, frame).await;
    assert_eq!(response.status, Status::Error);
    assert!(!response.message.unwrap().is_empty());
    assert!(response.detections.is_empty());
    assert!(response.inference_time.is_none());
  }

  client.send(Message::Text("hello".to_string())).await.unwrap();
  let response = next_response(&mut client).await;
  assert_eq!(response.status, Status::Error);

  let response = request(&mut client, png(8, [0, 255, 0])).await;
  assert_eq!(response.status, Status::Success);
  assert_eq!(response.detections[0].label, "green");

  server.stop().await;
}

#[tokio::test]
async fn responses_follow_request_order() {
  let server = TestServer::start().await;
  let mut client = server.connect().await;

  // 第一帧较慢，第二帧立即发出
  client.send(Message::Binary(png(SLOW_WIDTH, [255, 0, 0]))).await.unwrap();
  client.send(Message::Binary(png(8, [0, 0, 255]))).await.unwrap();

  let first = next_response(&mut client).await;
  let second = next_response(&mut client).await;
  assert_eq!(first.detections[0].label, "red");
  assert_eq!(second.detections[0].label, "blue");

  server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connections_are_independent() {
  let server = TestServer::start().await;

  let run = |color: [u8; 3], width: u32| {
    let addr = server.addr;
    async move {
      let (mut client, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
      let mut labels = Vec::new();
      for _ in 0..4 {
        let response = request(&mut client, png(width, color)).await;
        labels.extend(response.detections.into_iter().map(|d| d.label));
      }
      labels
    }
  };

  let (red, green) = tokio::join!(run([255, 0, 0], SLOW_WIDTH), run([0, 255, 0], 8));
  assert_eq!(red, ["red"; 4]);
  assert_eq!(green, ["green"; 4]);

  server.stop().await;
}

#[tokio::test]
async fn oversized_frames_are_rejected_before_decoding() {
  let server = TestServer::with_config(local_config().with_max_message_size(1024)).await;
  let mut client = server.connect().await;
  server.wait_for_connections(1).await;

  // 发送可能在服务端断开后失败，结果不重要
  let _ = client.send(Message::Binary(vec![0u8; 4096])).await;

  let reply = timeout(WAIT, client.next()).await.unwrap();
  assert!(
    !matches!(reply, Some(Ok(Message::Text(_)))),
    "oversized frame got a response: {:?}",
    reply
  );
  assert_eq!(server.decoded.load(Ordering::SeqCst), 0);
  server.wait_for_connections(0).await;

  server.stop().await;
}

#[tokio::test]
async fn disconnects_return_the_registry_to_baseline() {
  let server = TestServer::start().await;
  assert!(server.registry.is_empty());

  let mut client = server.connect().await;
  server.wait_for_connections(1).await;
  request(&mut client, png(8, [0, 0, 0])).await;
  client.close(None).await.unwrap();
  server.wait_for_connections(0).await;

  // 不经关闭握手直接断开
  let client = server.connect().await;
  server.wait_for_connections(1).await;
  drop(client);
  server.wait_for_connections(0).await;

  let _client = server.connect().await;
  server.wait_for_connections(1).await;
  assert_eq!(server.registry.snapshot().len(), 1);

  server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_idle_connections_and_stops_accepting() {
  let server = TestServer::start().await;
  let mut client = server.connect().await;
  server.wait_for_connections(1).await;
  let addr = server.addr;
  let registry = server.registry.clone();

  server.stop().await;

  let closing = timeout(WAIT, client.next()).await.unwrap();
  assert!(matches!(closing, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
  assert!(registry.is_empty());
  assert!(connect_async(format!("ws://{}", addr)).await.is_err());
}

#[tokio::test]
async fn bind_failure_is_reported_before_serving() {
  let server = TestServer::start().await;
  let config = local_config().with_port(server.addr.port());

  let err = Server::bind(config, ColourDetector, ImageDecoder)
    .await
    .err()
    .expect("second bind should fail");
  assert!(matches!(err, ServerError::Bind { .. }));

  server.stop().await;
}
