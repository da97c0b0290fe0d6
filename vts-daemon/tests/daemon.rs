//! End-to-end tests: a daemon instance over real TCP, backed by a
//! synthetic decoder so no media files or codec libraries are needed.

#![allow(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use vtsd::decode::{Decode, DecodeError};
use vtsd::server::Server;
use vtsd::source::{SourceHandle, SourceInfo, VideoSource};
use vtsource::formats::{PixelLayout, VideoFormat};
use vtsource::pixel::RgbFrame;
use vtsource::protocol::{FrameFlags, FrameHeader};

const MOCK_WIDTH: u32 = 64;
const MOCK_HEIGHT: u32 = 48;
const MOCK_RATE: f64 = 30.0;

/// Decoder over mock "clips": the file's first token is the frame count;
/// a second token `nodata` makes every decode come up empty.
struct MockDecoder {
    frames: u64,
    position: u64,
    starved: bool,
}

impl Decode for MockDecoder {
    fn open(path: &Path) -> Result<(Self, SourceInfo), DecodeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|_| DecodeError::NoVideoStream(path.to_path_buf()))?;
        let mut tokens = text.split_whitespace();
        let frames: u64 = tokens
            .next()
            .and_then(|count| count.parse().ok())
            .ok_or_else(|| DecodeError::NoVideoStream(path.to_path_buf()))?;
        let starved = tokens.next() == Some("nodata");

        let info = SourceInfo {
            path: path.to_path_buf(),
            width: MOCK_WIDTH,
            height: MOCK_HEIGHT,
            frame_count: frames,
            frame_rate: MOCK_RATE,
            duration_seconds: frames as f64 / MOCK_RATE,
            codec: "mock".to_string(),
            pixel_format: "rgb24".to_string(),
        };

        Ok((
            Self {
                frames,
                position: 0,
                starved,
            },
            info,
        ))
    }

    fn seek(&mut self, frame: u64) -> Result<(), DecodeError> {
        self.position = frame;
        Ok(())
    }

    fn decode_next(&mut self) -> Result<Option<RgbFrame>, DecodeError> {
        if self.starved || self.position >= self.frames {
            return Ok(None);
        }

        let color = [(self.position % 256) as u8, 7, 99];
        let data = color
            .iter()
            .copied()
            .cycle()
            .take(MOCK_WIDTH as usize * MOCK_HEIGHT as usize * 3)
            .collect();
        self.position += 1;
        Ok(Some(RgbFrame::new(MOCK_WIDTH, MOCK_HEIGHT, data)))
    }
}

struct Fixture {
    _media: tempfile::TempDir,
    media_root: PathBuf,
    addr: SocketAddr,
}

/// Start a daemon on an ephemeral port with a fresh media directory
/// containing `clips` (name, content) mock files.
async fn start_daemon(clips: &[(&str, &str)]) -> Fixture {
    let media = tempfile::tempdir().unwrap();
    for (name, content) in clips {
        std::fs::write(media.path().join(name), content).unwrap();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let source =
        SourceHandle::<MockDecoder>::spawn(VideoFormat::ntsc(PixelLayout::Rgb24), 30);
    let server = Server::new(source, Some(media.path().to_path_buf()));
    tokio::spawn(server.run(listener));

    Fixture {
        media_root: media.path().to_path_buf(),
        _media: media,
        addr,
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read),
            writer,
        };

        let greeting = client.recv_line().await;
        assert!(greeting.starts_with("OK HELLO VTSource "), "{greeting}");
        client
    }

    async fn send(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn recv_line(&mut self) -> String {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await.unwrap();
        assert!(read > 0, "connection closed");
        line.trim_end().to_string()
    }

    async fn roundtrip(&mut self, line: &str) -> String {
        self.send(line).await;
        self.recv_line().await
    }

    async fn recv_exact(&mut self, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        self.reader.read_exact(&mut data).await.unwrap();
        data
    }

    /// Issue GETFRAME and return the parsed header plus the payload.
    async fn getframe(&mut self, command: &str) -> (FrameHeader, Vec<u8>) {
        let response = self.roundtrip(command).await;
        let size: usize = response
            .strip_prefix("OK FRAMEDATA ")
            .unwrap_or_else(|| panic!("unexpected response: {response}"))
            .parse()
            .unwrap();

        let header = self.recv_exact(FrameHeader::SIZE).await;
        let header = FrameHeader::unpack(&header).unwrap();
        let payload = self.recv_exact(size).await;
        (header, payload)
    }
}

#[tokio::test]
async fn test_greeting_and_bye() {
    let daemon = start_daemon(&[]).await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(client.roundtrip("BYE").await, "OK BYE");
}

#[tokio::test]
async fn test_unknown_command() {
    let daemon = start_daemon(&[]).await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(
        client.roundtrip("FLIP").await,
        "ERROR 400 Unknown command: FLIP"
    );
    // HELLO is server-initiated only.
    assert_eq!(
        client.roundtrip("HELLO").await,
        "ERROR 400 Unknown command: HELLO"
    );
}

#[tokio::test]
async fn test_commands_are_case_insensitive() {
    let daemon = start_daemon(&[]).await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(client.roundtrip("status").await, "OK STATUS STOPPED 0 0");
}

#[tokio::test]
async fn test_load() {
    let daemon = start_daemon(&[("clip.mp4", "100"), ("broken.mp4", "xyz")]).await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(
        client.roundtrip("LOAD").await,
        "ERROR 401 LOAD requires filename"
    );
    let missing = client.roundtrip("LOAD missing.mp4").await;
    assert!(missing.starts_with("ERROR 404 File not found:"), "{missing}");
    assert_eq!(
        client.roundtrip("LOAD broken.mp4").await,
        "ERROR 500 Failed to load file"
    );
    assert_eq!(client.roundtrip("LOAD clip.mp4").await, "OK LOADED 100");
}

#[tokio::test]
async fn test_load_quoted_path_with_spaces() {
    let daemon = start_daemon(&[]).await;
    let spaced = daemon.media_root.join("with spaces");
    std::fs::create_dir(&spaced).unwrap();
    std::fs::write(spaced.join("video.mp4"), "42").unwrap();

    let mut client = Client::connect(daemon.addr).await;
    assert_eq!(
        client
            .roundtrip("LOAD \"with spaces/video.mp4\"")
            .await,
        "OK LOADED 42"
    );
}

#[tokio::test]
async fn test_load_replaces_previous_source() {
    let daemon = start_daemon(&[("a.mp4", "100"), ("b.mp4", "7")]).await;
    let mut client = Client::connect(daemon.addr).await;

    client.roundtrip("LOAD a.mp4").await;
    client.roundtrip("SEEK 50").await;
    assert_eq!(client.roundtrip("LOAD b.mp4").await, "OK LOADED 7");
    assert_eq!(client.roundtrip("STATUS").await, "OK STATUS STOPPED 0 7");
}

#[tokio::test]
async fn test_negative_seek() {
    let daemon = start_daemon(&[("clip.mp4", "1000")]).await;
    let mut client = Client::connect(daemon.addr).await;

    client.roundtrip("LOAD clip.mp4").await;
    assert_eq!(client.roundtrip("SEEK -1").await, "OK SEEKED 999");
    assert_eq!(client.roundtrip("SEEK -1000").await, "OK SEEKED 0");
    // More negative than -total clamps to 0.
    assert_eq!(client.roundtrip("SEEK -5000").await, "OK SEEKED 0");
}

#[tokio::test]
async fn test_seek_clamps_and_validates() {
    let daemon = start_daemon(&[("clip.mp4", "100")]).await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(client.roundtrip("SEEK 5").await, "ERROR 500 Seek failed");
    client.roundtrip("LOAD clip.mp4").await;
    assert_eq!(
        client.roundtrip("SEEK").await,
        "ERROR 401 SEEK requires frame number"
    );
    assert_eq!(
        client.roundtrip("SEEK abc").await,
        "ERROR 401 Invalid frame number"
    );
    assert_eq!(client.roundtrip("SEEK 5000").await, "OK SEEKED 99");
}

#[tokio::test]
async fn test_next_prev_and_loop_wrap() {
    let daemon = start_daemon(&[("clip.mp4", "100")]).await;
    let mut client = Client::connect(daemon.addr).await;
    client.roundtrip("LOAD clip.mp4").await;

    assert_eq!(client.roundtrip("NEXT").await, "OK FRAME 1");
    assert_eq!(client.roundtrip("PREV").await, "OK FRAME 0");
    assert_eq!(client.roundtrip("PREV").await, "OK START");

    assert_eq!(client.roundtrip("SEEK 99").await, "OK SEEKED 99");
    assert_eq!(client.roundtrip("NEXT").await, "OK END");

    assert_eq!(client.roundtrip("LOOP ON").await, "OK LOOP ON");
    assert_eq!(client.roundtrip("NEXT").await, "OK FRAME 0");

    assert_eq!(client.roundtrip("LOOP OFF").await, "OK LOOP OFF");
    assert_eq!(client.roundtrip("SEEK 99").await, "OK SEEKED 99");
    assert_eq!(client.roundtrip("NEXT").await, "OK END");
}

#[tokio::test]
async fn test_loop_query_and_tokens() {
    let daemon = start_daemon(&[]).await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(client.roundtrip("LOOP").await, "OK LOOP OFF");
    assert_eq!(client.roundtrip("LOOP yes").await, "OK LOOP ON");
    assert_eq!(client.roundtrip("LOOP").await, "OK LOOP ON");
    // Unrecognized tokens behave as a query.
    assert_eq!(client.roundtrip("LOOP banana").await, "OK LOOP ON");
    assert_eq!(client.roundtrip("LOOP 0").await, "OK LOOP OFF");
}

#[tokio::test]
async fn test_play_pause_stop_status() {
    let daemon = start_daemon(&[("clip.mp4", "100")]).await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(client.roundtrip("PLAY").await, "ERROR 501 No file loaded");
    assert_eq!(client.roundtrip("PAUSE").await, "OK PAUSED");
    assert_eq!(client.roundtrip("STATUS").await, "OK STATUS PAUSED 0 0");

    client.roundtrip("LOAD clip.mp4").await;
    assert_eq!(client.roundtrip("PLAY").await, "OK PLAYING");
    assert_eq!(client.roundtrip("STATUS").await, "OK STATUS PLAYING 0 100");

    client.roundtrip("SEEK 42").await;
    assert_eq!(client.roundtrip("STOP").await, "OK STOPPED");
    assert_eq!(client.roundtrip("STATUS").await, "OK STATUS STOPPED 0 100");
}

#[tokio::test]
async fn test_info_and_source() {
    let daemon = start_daemon(&[("clip.mp4", "100")]).await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(client.roundtrip("INFO").await, "OK INFO none");
    assert_eq!(client.roundtrip("SOURCE").await, "OK SOURCE NONE");

    client.roundtrip("LOAD clip.mp4").await;
    assert_eq!(
        client.roundtrip("INFO").await,
        "OK INFO 64x48 30.00fps mock 100 frames 3.33s"
    );

    let path = daemon.media_root.join("clip.mp4");
    assert_eq!(
        client.roundtrip("SOURCE").await,
        format!("OK SOURCE \"{}\" 100 64x48 30.00 mock", path.display())
    );
}

#[tokio::test]
async fn test_frameinfo() {
    let daemon = start_daemon(&[("clip.mp4", "100")]).await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(
        client.roundtrip("FRAMEINFO").await,
        "ERROR 501 No file loaded"
    );

    client.roundtrip("LOAD clip.mp4").await;
    // NTSC: frame 30 lands on 30 * 1001/30 = 1001 ms.
    assert_eq!(
        client.roundtrip("FRAMEINFO 30").await,
        "OK FRAMEINFO 30 1001 720 486 0 0"
    );
    assert_eq!(
        client.roundtrip("FRAMEINFO 0").await,
        "OK FRAMEINFO 0 0 720 486 0 1"
    );
    assert_eq!(
        client.roundtrip("FRAMEINFO 99").await,
        "OK FRAMEINFO 99 3303 720 486 0 8"
    );
    assert_eq!(
        client.roundtrip("FRAMEINFO 100").await,
        "ERROR 401 Frame out of range: 100"
    );
    assert_eq!(
        client.roundtrip("FRAMEINFO abc").await,
        "ERROR 401 Invalid frame number: abc"
    );

    // No argument reports the current frame.
    client.roundtrip("SEEK 10").await;
    assert_eq!(
        client.roundtrip("FRAMEINFO").await,
        "OK FRAMEINFO 10 333 720 486 0 0"
    );
}

#[tokio::test]
async fn test_getframe_ntsc_rgb24() {
    let daemon = start_daemon(&[("clip.mp4", "100")]).await;
    let mut client = Client::connect(daemon.addr).await;
    client.roundtrip("LOAD clip.mp4").await;

    let (header, payload) = client.getframe("GETFRAME 0").await;
    assert_eq!(payload.len(), 720 * 486 * 3);
    assert_eq!(header.sequence, 0);
    assert_eq!(header.timestamp_ms, 0);
    assert_eq!(header.width, 720);
    assert_eq!(header.height, 486);
    assert_eq!(header.colorspace, 0);
    assert_eq!(header.flags, FrameFlags::KEYFRAME);

    let (header, payload) = client.getframe("GETFRAME 30").await;
    assert_eq!(payload.len(), 720 * 486 * 3);
    assert_eq!(header.sequence, 30);
    assert_eq!(header.timestamp_ms, 1001);
    assert_eq!(header.flags, FrameFlags::empty());

    // The protocol stays line-oriented after the binary unit.
    assert_eq!(client.roundtrip("STATUS").await, "OK STATUS STOPPED 30 100");
}

#[tokio::test]
async fn test_getframe_pal_sizing() {
    let daemon = start_daemon(&[("clip.mp4", "100")]).await;
    let mut client = Client::connect(daemon.addr).await;
    client.roundtrip("LOAD clip.mp4").await;

    assert_eq!(
        client.roundtrip("FORMAT PAL RGB24").await,
        "OK FORMAT PAL RGB24"
    );

    let (header, payload) = client.getframe("GETFRAME 0").await;
    assert_eq!(payload.len(), 1_244_160);
    assert_eq!(header.width, 720);
    assert_eq!(header.height, 576);
    assert_eq!(header.colorspace, 0);
}

#[tokio::test]
async fn test_format_switch_resizes_frames() {
    let daemon = start_daemon(&[("clip.mp4", "100")]).await;
    let mut client = Client::connect(daemon.addr).await;
    client.roundtrip("LOAD clip.mp4").await;

    let (_, payload) = client.getframe("GETFRAME 5").await;
    assert_eq!(payload.len(), 720 * 486 * 3);

    assert_eq!(
        client.roundtrip("FORMAT NTSC YUV422").await,
        "OK FORMAT NTSC YUV422"
    );
    let (header, payload) = client.getframe("GETFRAME 5").await;
    assert_eq!(payload.len(), 720 * 486 * 2);
    assert_eq!(header.colorspace, 1);

    assert_eq!(
        client.roundtrip("FORMAT NTSC YUV420P").await,
        "OK FORMAT NTSC YUV420P"
    );
    let (header, payload) = client.getframe("GETFRAME 5").await;
    assert_eq!(payload.len(), 720 * 486 * 3 / 2);
    assert_eq!(header.colorspace, 2);
}

#[tokio::test]
async fn test_format_query_and_errors() {
    let daemon = start_daemon(&[]).await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(client.roundtrip("FORMAT").await, "OK FORMAT NTSC RGB24");
    assert_eq!(
        client.roundtrip("FORMAT SECAM").await,
        "ERROR 401 Unknown format: SECAM"
    );
    assert_eq!(
        client.roundtrip("FORMAT NTSC RGBA").await,
        "ERROR 401 Unknown colorspace: RGBA"
    );
    // Standard alone defaults the colorspace to RGB24.
    assert_eq!(client.roundtrip("FORMAT pal").await, "OK FORMAT PAL RGB24");
}

#[tokio::test]
async fn test_getframe_errors() {
    let daemon = start_daemon(&[("empty.mp4", "5 nodata")]).await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(
        client.roundtrip("GETFRAME").await,
        "ERROR 500 Frame not available"
    );
    assert_eq!(
        client.roundtrip("GETFRAME abc").await,
        "ERROR 401 Invalid frame number"
    );

    client.roundtrip("LOAD empty.mp4").await;
    assert_eq!(
        client.roundtrip("GETFRAME 2").await,
        "ERROR 500 Frame not available"
    );
    // A failed decode leaves the position untouched.
    assert_eq!(client.roundtrip("STATUS").await, "OK STATUS STOPPED 0 5");
}

#[tokio::test]
async fn test_list() {
    let daemon = start_daemon(&[
        ("b.mp4", "10"),
        ("a.mkv", "10"),
        ("notes.txt", "not a video"),
    ])
    .await;
    let mut client = Client::connect(daemon.addr).await;

    assert_eq!(client.roundtrip("LIST").await, "OK LIST 2");
    assert_eq!(client.recv_line().await, "a.mkv");
    assert_eq!(client.recv_line().await, "b.mp4");

    assert_eq!(client.roundtrip("LIST b.mp4").await, "OK LIST 1");
    assert_eq!(client.recv_line().await, "b.mp4");

    let missing = client.roundtrip("LIST nowhere").await;
    assert!(missing.starts_with("ERROR 404 Path not found:"), "{missing}");
}

#[tokio::test]
async fn test_invalid_utf8_line() {
    let daemon = start_daemon(&[]).await;
    let mut client = Client::connect(daemon.addr).await;

    client.writer.write_all(b"STAT\xffUS\n").await.unwrap();
    assert_eq!(client.recv_line().await, "ERROR 401 Invalid UTF-8");

    // The connection keeps working afterwards.
    assert_eq!(client.roundtrip("STATUS").await, "OK STATUS STOPPED 0 0");
}

#[tokio::test]
async fn test_shared_source_across_connections() {
    let daemon = start_daemon(&[("clip.mp4", "100")]).await;
    let mut first = Client::connect(daemon.addr).await;
    let mut second = Client::connect(daemon.addr).await;

    first.roundtrip("LOAD clip.mp4").await;
    first.roundtrip("SEEK 42").await;

    // The other client observes the shared engine state.
    assert_eq!(second.roundtrip("STATUS").await, "OK STATUS STOPPED 42 100");

    first.roundtrip("BYE").await;
    // Disconnecting one client leaves the source untouched.
    assert_eq!(second.roundtrip("STATUS").await, "OK STATUS STOPPED 42 100");
}

// Engine-level checks against the state machine itself.

fn mock_clip(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_engine_load_resets_position() {
    let dir = tempfile::tempdir().unwrap();
    let clip = mock_clip(&dir, "clip.mp4", "100");

    let mut source =
        VideoSource::<MockDecoder>::new(VideoFormat::ntsc(PixelLayout::Rgb24), 30);
    assert!(!source.is_loaded());

    source.load(&clip).unwrap();
    source.seek(50).unwrap();
    assert_eq!(source.current_frame(), 50);

    source.load(&clip).unwrap();
    assert_eq!(source.current_frame(), 0);
    assert_eq!(source.total_frames(), 100);
}

#[test]
fn test_engine_close_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let clip = mock_clip(&dir, "clip.mp4", "100");

    let mut source =
        VideoSource::<MockDecoder>::new(VideoFormat::ntsc(PixelLayout::Rgb24), 30);
    source.load(&clip).unwrap();
    source.close();
    source.close();

    assert!(!source.is_loaded());
    assert_eq!(source.current_frame(), 0);
    assert_eq!(source.total_frames(), 0);
}

#[test]
fn test_engine_failed_decode_keeps_state() {
    let dir = tempfile::tempdir().unwrap();
    let clip = mock_clip(&dir, "clip.mp4", "10 nodata");

    let mut source =
        VideoSource::<MockDecoder>::new(VideoFormat::ntsc(PixelLayout::Rgb24), 30);
    source.load(&clip).unwrap();
    source.seek(3).unwrap();

    assert!(source.get_frame(Some(5)).is_err());
    assert_eq!(source.current_frame(), 3);
}

#[test]
fn test_engine_cached_frame_is_stable() {
    let dir = tempfile::tempdir().unwrap();
    let clip = mock_clip(&dir, "clip.mp4", "10");

    let mut source =
        VideoSource::<MockDecoder>::new(VideoFormat::ntsc(PixelLayout::Rgb24), 30);
    source.load(&clip).unwrap();

    let (number, first) = source.get_frame(Some(4)).unwrap();
    assert_eq!(number, 4);
    let (_, second) = source.get_frame(Some(4)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_engine_format_change_rerenders() {
    let dir = tempfile::tempdir().unwrap();
    let clip = mock_clip(&dir, "clip.mp4", "10");

    let ntsc = VideoFormat::ntsc(PixelLayout::Rgb24);
    let mut source = VideoSource::<MockDecoder>::new(ntsc, 30);
    source.load(&clip).unwrap();

    let (_, rgb) = source.get_frame(Some(2)).unwrap();
    assert_eq!(rgb.len(), ntsc.frame_size_bytes());

    let uyvy_format = VideoFormat::ntsc(PixelLayout::Yuv422);
    source.set_output_format(uyvy_format);
    let (_, uyvy) = source.get_frame(Some(2)).unwrap();
    assert_eq!(uyvy.len(), uyvy_format.frame_size_bytes());
}

#[test]
fn test_engine_getframe_clamps_into_range() {
    let dir = tempfile::tempdir().unwrap();
    let clip = mock_clip(&dir, "clip.mp4", "10");

    let mut source =
        VideoSource::<MockDecoder>::new(VideoFormat::ntsc(PixelLayout::Rgb24), 30);
    source.load(&clip).unwrap();

    let (number, _) = source.get_frame(Some(-3)).unwrap();
    assert_eq!(number, 0);
    let (number, _) = source.get_frame(Some(500)).unwrap();
    assert_eq!(number, 9);
    assert_eq!(source.current_frame(), 9);
}
