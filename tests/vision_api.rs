use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use entry_vision::api::{ApiConfig, ApiHandle, ApiServer};
use entry_vision::classify::UnavailableClassifier;
use entry_vision::detect::{DetectionBox, StubBackend, CLASS_CAR};
use entry_vision::ingest::{self, FrameSource};
use entry_vision::plate::{PlateCandidate, PlateReader, PlateResolver, RegistryClient};
use entry_vision::service::PipelineFactory;
use entry_vision::{Frame, ManualClock, VehicleDetector, VisionService, WorkerSettings};

const GATE: &str = "stub://gate?w=320&h=240&fps=50";

struct FixedReader;

impl PlateReader for FixedReader {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn read(&self, _crop: &Frame) -> Result<Vec<PlateCandidate>> {
        Ok(vec![PlateCandidate {
            text: "abc 123".to_string(),
            score: 0.91,
        }])
    }
}

struct FixedRegistry;

impl RegistryClient for FixedRegistry {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn lookup_by_plate(&self, plate: &str) -> Result<Option<Value>> {
        if plate == "ABC123" {
            Ok(Some(json!({
                "vehicle_info": {"brand": "Tesla", "model": "Model 3", "vehicle_type": "Eléctrico"}
            })))
        } else {
            Ok(None)
        }
    }
}

/// Stub sources with a car parked in the middle of the frame.
struct ParkedCar;

impl PipelineFactory for ParkedCar {
    fn open_source(&self, source_id: &str) -> Result<Box<dyn FrameSource>> {
        ingest::open_source(source_id)
    }

    fn build_detector(&self, _source_id: &str) -> VehicleDetector {
        VehicleDetector::with_primary(Box::new(StubBackend::fixed(vec![DetectionBox {
            x: 100,
            y: 80,
            w: 120,
            h: 110,
            confidence: 0.9,
            class_id: CLASS_CAR,
        }])))
    }
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

struct TestApi {
    service: Arc<VisionService>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let clock = Arc::new(ManualClock::new(1_000.0));
        let resolver = PlateResolver::new(
            Arc::new(FixedReader),
            Arc::new(FixedRegistry),
            1800.0,
            clock.clone(),
        );
        let service = Arc::new(VisionService::new(
            Arc::new(ParkedCar),
            Arc::new(resolver),
            Arc::new(UnavailableClassifier),
            clock,
            WorkerSettings::default(),
        ));
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        };
        let api_handle = ApiServer::new(api_config, service.clone()).spawn()?;
        Ok(Self {
            service,
            api_handle: Some(api_handle),
        })
    }

    fn request(&self, method: &str, target: &str) -> Result<(String, Value)> {
        let addr = self
            .api_handle
            .as_ref()
            .expect("test API handle should be initialized")
            .addr;
        let mut stream = TcpStream::connect(addr)?;
        let request = format!("{method} {target} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        stream.write_all(request.as_bytes())?;
        let (headers, body) = read_response(&mut stream)?;
        Ok((headers, serde_json::from_str(&body)?))
    }

    fn wait_for_entries(&self) -> Result<Value> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            let (_, body) = self.request("GET", "/api/vision/entries?since_sec=600")?;
            if body["items"].as_array().map_or(false, |items| !items.is_empty()) {
                return Ok(body);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        Err(anyhow!("no entries committed"))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
        self.service.shutdown().expect("failed to stop workers");
    }
}

fn encoded(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[test]
fn health_endpoint_is_public() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.request("GET", "/health")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body, json!({"status": "ok"}));
    Ok(())
}

#[test]
fn parked_car_produces_one_entry_and_summary() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.request("POST", &format!("/api/vision/sources?url={}", encoded(GATE)))?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["status"], "started");
    assert_eq!(body["url"], GATE);
    assert_eq!(body["rois"], json!([[0.1, 0.3, 0.9, 0.8]]));

    let body = api.wait_for_entries()?;
    // Let a few more frames go by; the parked car must not count again.
    std::thread::sleep(Duration::from_millis(300));
    let (_, body_later) = api.request("GET", "/api/vision/entries?since_sec=600")?;
    assert_eq!(body_later["items"].as_array().map(Vec::len), Some(1));

    let item = &body["items"][0];
    assert_eq!(item["plate"], "ABC123");
    assert_eq!(item["brand"], "Tesla");
    assert_eq!(item["model"], "Model 3");
    assert_eq!(item["category"], "EV");
    assert_eq!(item["origin"], "etecnic");
    assert_eq!(item["score"], 0.91);
    assert_eq!(item["source"], GATE);
    assert_eq!(item["ts"], 1000.0);

    let (_, summary) = api.request("GET", "/api/vision/summary?window_sec=600")?;
    assert_eq!(
        summary,
        json!({"window_sec": 600, "total": 1, "ev": 1, "phev": 0, "indeterminado": 0})
    );
    Ok(())
}

#[test]
fn second_start_reports_already_running() -> Result<()> {
    let api = TestApi::new()?;
    let target = format!("/api/vision/sources?url={}&x0=0&y0=0&x1=1&y1=1", encoded(GATE));
    api.request("POST", &target)?;
    let (_, body) = api.request("POST", &format!("/api/vision/sources?url={}", encoded(GATE)))?;
    assert_eq!(body["status"], "already_running");
    assert_eq!(body["rois"], json!([[0.0, 0.0, 1.0, 1.0]]));
    Ok(())
}

#[test]
fn zone_updates_validate_input_and_source() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.request(
        "PUT",
        &format!("/api/vision/sources/rois?url={}&rois={}", encoded(GATE), encoded("[[0,0,1,1]]")),
    )?;
    assert!(headers.contains("404 Not Found"));
    assert_eq!(body["error"], "source not started");

    api.request("POST", &format!("/api/vision/sources?url={}", encoded(GATE)))?;
    let (headers, body) = api.request(
        "PUT",
        &format!("/api/vision/sources/rois?url={}&rois={}", encoded(GATE), encoded("[[0.9,0,0.1,1]]")),
    )?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "invalid rois");

    let (headers, body) = api.request(
        "PUT",
        &format!(
            "/api/vision/sources/rois?url={}&rois={}",
            encoded(GATE),
            encoded("[[-0.5,0,0.5,1.5]]")
        ),
    )?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body["status"], "updated");
    assert_eq!(body["rois"], json!([[0.0, 0.0, 0.5, 1.0]]));
    Ok(())
}

#[test]
fn start_rejects_bad_requests() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, _) = api.request("POST", "/api/vision/sources")?;
    assert!(headers.contains("400 Bad Request"));

    let (headers, body) = api.request(
        "POST",
        &format!("/api/vision/sources?url={}&x0=0.95", encoded(GATE)),
    )?;
    assert!(headers.contains("400 Bad Request"));
    assert_eq!(body["error"], "invalid rois");

    let (headers, _) = api.request("POST", "/api/vision/sources?url=ftp%3A%2F%2Fcamera")?;
    assert!(headers.contains("400 Bad Request"));

    let (headers, _) = api.request("GET", "/api/vision/sources")?;
    assert!(headers.contains("405 Method Not Allowed"));
    let (headers, _) = api.request("GET", "/nope")?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn stop_is_idempotent_and_clears_debug_stream() -> Result<()> {
    let api = TestApi::new()?;
    api.request("POST", &format!("/api/vision/sources?url={}", encoded(GATE)))?;
    for _ in 0..2 {
        let (headers, body) = api.request("DELETE", &format!("/api/vision/sources?url={}", encoded(GATE)))?;
        assert!(headers.contains("200 OK"));
        assert_eq!(body, json!({"status": "stopped", "url": GATE}));
    }
    let (headers, _) = api.request("GET", &format!("/api/vision/debug?url={}", encoded(GATE)))?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn entries_limit_is_clamped() -> Result<()> {
    let api = TestApi::new()?;
    let (headers, body) = api.request("GET", "/api/vision/entries?since_sec=0&limit=0")?;
    assert!(headers.contains("200 OK"));
    assert_eq!(body, json!({"items": []}));
    let (headers, _) = api.request("GET", "/api/vision/entries?limit=many")?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn debug_stream_serves_multipart_jpeg() -> Result<()> {
    let api = TestApi::new()?;
    api.request("POST", &format!("/api/vision/sources?url={}", encoded(GATE)))?;

    let addr = api.api_handle.as_ref().map(|h| h.addr).ok_or_else(|| anyhow!("no api"))?;
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    let request = format!(
        "GET /api/vision/debug?url={}&w=160&q=70 HTTP/1.1\r\nHost: localhost\r\n\r\n",
        encoded(GATE)
    );
    stream.write_all(request.as_bytes())?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    let marker = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xFF\xD8";
    while !received.windows(marker.len()).any(|w| w == marker) {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(received.windows(marker.len()).any(|w| w == marker));
    Ok(())
}
