use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use vtsource::formats::{PixelLayout, VideoFormat};
use vtsource::protocol::{self, Command, ErrorCode, FrameFlags, FrameHeader};

use crate::decode::Decode;
use crate::source::{PlayState, SourceHandle};

/// Extensions recognized by LIST, matched case-insensitively.
const VIDEO_EXTENSIONS: [&str; 6] = ["mp4", "mov", "avi", "mkv", "webm", "m4v"];

const LOOP_TRUTHY: [&str; 4] = ["ON", "TRUE", "1", "YES"];
const LOOP_FALSY: [&str; 4] = ["OFF", "FALSE", "0", "NO"];

enum Flow {
    Continue,
    Quit,
}

/// TCP front end: accepts connections and speaks the line protocol,
/// funneling every engine operation through the shared [`SourceHandle`].
pub struct Server<D: Decode> {
    source: SourceHandle<D>,
    media_root: Option<PathBuf>,
}

impl<D: Decode> Clone for Server<D> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            media_root: self.media_root.clone(),
        }
    }
}

impl<D: Decode + 'static> Server<D> {
    pub fn new(source: SourceHandle<D>, media_root: Option<PathBuf>) -> Self {
        Self { source, media_root }
    }

    /// Accept loop. Each connection runs in its own task with its own
    /// receive buffer; all of them share one source engine.
    pub async fn run(self, listener: TcpListener) -> io::Result<()> {
        info!("VTS daemon listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                info!("Connection from {peer}");
                if let Err(err) = server.handle_client(stream, peer).await {
                    debug!("[{peer}] connection error: {err}");
                }
                info!("Connection closed: {peer}");
            });
        }
    }

    async fn handle_client(&self, mut stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        send_line(
            &mut stream,
            &format!("OK HELLO VTSource {}", env!("CARGO_PKG_VERSION")),
        )
        .await?;

        let mut buffer = BytesMut::with_capacity(4096);
        loop {
            while let Some(end) = buffer.iter().position(|&byte| byte == b'\n') {
                let line = buffer.split_to(end + 1);
                let line = &line[..line.len() - 1];
                let line = line.strip_suffix(b"\r").unwrap_or(line);

                let Ok(text) = std::str::from_utf8(line) else {
                    send_error(&mut stream, ErrorCode::InvalidArgument, "Invalid UTF-8").await?;
                    continue;
                };
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }

                debug!("[{peer}] Command: {text}");
                match self.dispatch(&mut stream, text).await? {
                    Flow::Continue => {}
                    Flow::Quit => return Ok(()),
                }
            }

            if stream.read_buf(&mut buffer).await? == 0 {
                return Ok(());
            }
        }
    }

    async fn dispatch(&self, stream: &mut TcpStream, line: &str) -> io::Result<Flow> {
        let (token, args) = protocol::parse_command(line);
        let Some(command) = Command::from_token(&token) else {
            send_error(
                stream,
                ErrorCode::UnknownCommand,
                &format!("Unknown command: {token}"),
            )
            .await?;
            return Ok(Flow::Continue);
        };

        match command {
            Command::Bye => {
                send_line(stream, "OK BYE").await?;
                return Ok(Flow::Quit);
            }
            Command::List => self.cmd_list(stream, &args).await?,
            Command::Load => self.cmd_load(stream, &args).await?,
            Command::Play => self.cmd_play(stream).await?,
            Command::Pause => self.cmd_pause(stream).await?,
            Command::Stop => self.cmd_stop(stream).await?,
            Command::Seek => self.cmd_seek(stream, &args).await?,
            Command::Next => self.cmd_next(stream).await?,
            Command::Prev => self.cmd_prev(stream).await?,
            Command::GetFrame => self.cmd_getframe(stream, &args).await?,
            Command::Status => self.cmd_status(stream).await?,
            Command::Info => self.cmd_info(stream).await?,
            Command::Source => self.cmd_source(stream).await?,
            Command::FrameInfo => self.cmd_frameinfo(stream, &args).await?,
            Command::Loop => self.cmd_loop(stream, &args).await?,
            Command::Format => self.cmd_format(stream, &args).await?,
        }

        Ok(Flow::Continue)
    }

    async fn cmd_load(&self, stream: &mut TcpStream, args: &[String]) -> io::Result<()> {
        if args.is_empty() {
            return send_error(stream, ErrorCode::InvalidArgument, "LOAD requires filename").await;
        }

        let path = self.resolve_path(Path::new(&args.join(" ")));
        if !path.exists() {
            return send_error(
                stream,
                ErrorCode::FileNotFound,
                &format!("File not found: {}", path.display()),
            )
            .await;
        }

        let result = self
            .source
            .with(move |source| source.load(&path))
            .await;
        match result {
            Ok(total) => send_line(stream, &format!("OK LOADED {total}")).await,
            Err(err) => {
                warn!("Load failed: {err}");
                send_error(stream, ErrorCode::InternalError, "Failed to load file").await
            }
        }
    }

    async fn cmd_play(&self, stream: &mut TcpStream) -> io::Result<()> {
        let started = self
            .source
            .with(|source| {
                if source.is_loaded() {
                    source.set_state(PlayState::Playing);
                    true
                } else {
                    false
                }
            })
            .await;

        if started {
            send_line(stream, "OK PLAYING").await
        } else {
            send_error(stream, ErrorCode::NotLoaded, "No file loaded").await
        }
    }

    async fn cmd_pause(&self, stream: &mut TcpStream) -> io::Result<()> {
        self.source
            .with(|source| source.set_state(PlayState::Paused))
            .await;
        send_line(stream, "OK PAUSED").await
    }

    async fn cmd_stop(&self, stream: &mut TcpStream) -> io::Result<()> {
        self.source
            .with(|source| {
                source.set_state(PlayState::Stopped);
                let _ = source.seek(0);
            })
            .await;
        send_line(stream, "OK STOPPED").await
    }

    async fn cmd_seek(&self, stream: &mut TcpStream, args: &[String]) -> io::Result<()> {
        let Some(arg) = args.first() else {
            return send_error(stream, ErrorCode::InvalidArgument, "SEEK requires frame number")
                .await;
        };
        let Ok(frame) = arg.parse::<i64>() else {
            return send_error(stream, ErrorCode::InvalidArgument, "Invalid frame number").await;
        };

        let result = self.source.with(move |source| source.seek(frame)).await;
        match result {
            Ok(current) => send_line(stream, &format!("OK SEEKED {current}")).await,
            Err(err) => {
                warn!("Seek failed: {err}");
                send_error(stream, ErrorCode::InternalError, "Seek failed").await
            }
        }
    }

    async fn cmd_next(&self, stream: &mut TcpStream) -> io::Result<()> {
        let (advanced, current) = self
            .source
            .with(|source| (source.advance(), source.current_frame()))
            .await;

        if advanced {
            send_line(stream, &format!("OK FRAME {current}")).await
        } else {
            send_line(stream, "OK END").await
        }
    }

    async fn cmd_prev(&self, stream: &mut TcpStream) -> io::Result<()> {
        let (moved, current) = self
            .source
            .with(|source| (source.retreat(), source.current_frame()))
            .await;

        if moved {
            send_line(stream, &format!("OK FRAME {current}")).await
        } else {
            send_line(stream, "OK START").await
        }
    }

    async fn cmd_getframe(&self, stream: &mut TcpStream, args: &[String]) -> io::Result<()> {
        let frame = match args.first() {
            Some(arg) => match arg.parse::<i64>() {
                Ok(frame) => Some(frame),
                Err(_) => {
                    return send_error(stream, ErrorCode::InvalidArgument, "Invalid frame number")
                        .await;
                }
            },
            None => None,
        };

        // Snapshot the format and total under the same engine pass so the
        // header always describes the bytes actually served.
        let (result, format, total) = self
            .source
            .with(move |source| {
                let result = source.get_frame(frame);
                (result, source.output_format(), source.total_frames())
            })
            .await;

        match result {
            Ok((number, data)) => {
                let header = FrameHeader {
                    sequence: number as u32,
                    timestamp_ms: format.timestamp_ms(number) as u32,
                    width: format.width as u16,
                    height: format.height as u16,
                    colorspace: format.layout.code(),
                    flags: FrameFlags::for_frame(number, total),
                    reserved: 0,
                };

                send_line(stream, &format!("OK FRAMEDATA {}", data.len())).await?;
                stream.write_all(&header.pack()).await?;
                stream.write_all(&data).await
            }
            Err(err) => {
                warn!("Frame fetch failed: {err}");
                send_error(stream, ErrorCode::InternalError, "Frame not available").await
            }
        }
    }

    async fn cmd_status(&self, stream: &mut TcpStream) -> io::Result<()> {
        let (state, current, total) = self
            .source
            .with(|source| (source.state(), source.current_frame(), source.total_frames()))
            .await;
        send_line(stream, &protocol::format_status(state.name(), current, total)).await
    }

    async fn cmd_info(&self, stream: &mut TcpStream) -> io::Result<()> {
        let info = self.source.with(|source| source.info().cloned()).await;
        match info {
            Some(info) => {
                send_line(
                    stream,
                    &format!(
                        "OK INFO {}x{} {:.2}fps {} {} frames {:.2}s",
                        info.width,
                        info.height,
                        info.frame_rate,
                        info.codec,
                        info.frame_count,
                        info.duration_seconds
                    ),
                )
                .await
            }
            None => send_line(stream, "OK INFO none").await,
        }
    }

    async fn cmd_source(&self, stream: &mut TcpStream) -> io::Result<()> {
        let info = self.source.with(|source| source.info().cloned()).await;
        match info {
            Some(info) => {
                send_line(
                    stream,
                    &format!(
                        "OK SOURCE \"{}\" {} {}x{} {:.2} {}",
                        info.path.display(),
                        info.frame_count,
                        info.width,
                        info.height,
                        info.frame_rate,
                        info.codec
                    ),
                )
                .await
            }
            None => send_line(stream, "OK SOURCE NONE").await,
        }
    }

    async fn cmd_frameinfo(&self, stream: &mut TcpStream, args: &[String]) -> io::Result<()> {
        let (loaded, current, total, format) = self
            .source
            .with(|source| {
                (
                    source.is_loaded(),
                    source.current_frame(),
                    source.total_frames(),
                    source.output_format(),
                )
            })
            .await;

        if !loaded {
            return send_error(stream, ErrorCode::NotLoaded, "No file loaded").await;
        }

        let frame = match args.first() {
            Some(arg) => match arg.parse::<i64>() {
                Ok(frame) => frame,
                Err(_) => {
                    return send_error(
                        stream,
                        ErrorCode::InvalidArgument,
                        &format!("Invalid frame number: {arg}"),
                    )
                    .await;
                }
            },
            None => current as i64,
        };

        if frame < 0 || frame as u64 >= total {
            return send_error(
                stream,
                ErrorCode::InvalidArgument,
                &format!("Frame out of range: {frame}"),
            )
            .await;
        }

        let frame = frame as u64;
        send_line(
            stream,
            &format!(
                "OK FRAMEINFO {frame} {} {} {} {} {}",
                format.timestamp_ms(frame),
                format.width,
                format.height,
                format.layout.code(),
                FrameFlags::for_frame(frame, total).bits()
            ),
        )
        .await
    }

    async fn cmd_loop(&self, stream: &mut TcpStream, args: &[String]) -> io::Result<()> {
        let arg = args.first().map(|arg| arg.to_uppercase());
        let looping = match arg.as_deref() {
            Some(value) if LOOP_TRUTHY.contains(&value) => {
                self.source.with(|source| source.set_looping(true)).await;
                true
            }
            Some(value) if LOOP_FALSY.contains(&value) => {
                self.source.with(|source| source.set_looping(false)).await;
                false
            }
            // Anything else is a query.
            _ => self.source.with(|source| source.looping()).await,
        };

        send_line(stream, if looping { "OK LOOP ON" } else { "OK LOOP OFF" }).await
    }

    async fn cmd_format(&self, stream: &mut TcpStream, args: &[String]) -> io::Result<()> {
        let Some(standard) = args.first() else {
            let format = self.source.with(|source| source.output_format()).await;
            return send_line(
                stream,
                &format!("OK FORMAT {} {}", format.standard.name(), format.layout.name()),
            )
            .await;
        };
        let standard = standard.to_uppercase();

        let layout = match args.get(1) {
            Some(name) => {
                let name = name.to_uppercase();
                match PixelLayout::from_name(&name) {
                    Some(layout) => layout,
                    None => {
                        return send_error(
                            stream,
                            ErrorCode::InvalidArgument,
                            &format!("Unknown colorspace: {name}"),
                        )
                        .await;
                    }
                }
            }
            None => PixelLayout::Rgb24,
        };

        let format = match standard.as_str() {
            "NTSC" => VideoFormat::ntsc(layout),
            "PAL" => VideoFormat::pal(layout),
            _ => {
                return send_error(
                    stream,
                    ErrorCode::InvalidArgument,
                    &format!("Unknown format: {standard}"),
                )
                .await;
            }
        };

        self.source
            .with(move |source| source.set_output_format(format))
            .await;
        send_line(stream, &format!("OK FORMAT {standard} {}", layout.name())).await
    }

    async fn cmd_list(&self, stream: &mut TcpStream, args: &[String]) -> io::Result<()> {
        let path = match args.first() {
            Some(arg) => self.resolve_path(Path::new(arg)),
            None => self
                .media_root
                .clone()
                .unwrap_or_else(|| PathBuf::from(".")),
        };

        if !path.exists() {
            return send_error(
                stream,
                ErrorCode::FileNotFound,
                &format!("Path not found: {}", path.display()),
            )
            .await;
        }

        match list_video_files(&path) {
            Ok(files) => {
                send_line(stream, &format!("OK LIST {}", files.len())).await?;
                for file in &files {
                    send_line(stream, file).await?;
                }
                Ok(())
            }
            Err(err) => {
                warn!("Listing {} failed: {err}", path.display());
                send_error(stream, ErrorCode::InternalError, "Failed to list directory").await
            }
        }
    }

    /// Relative paths resolve against the media root when one is
    /// configured; absolute paths pass through untouched.
    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_relative() {
            if let Some(root) = &self.media_root {
                return root.join(path);
            }
        }
        path.to_path_buf()
    }
}

/// Video files under `path` (or `path` itself when it names a file),
/// sorted ascending by name.
fn list_video_files(path: &Path) -> io::Result<Vec<String>> {
    if path.is_file() {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(vec![name]);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let recognized = Path::new(&name)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                VIDEO_EXTENSIONS
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            });
        if recognized {
            files.push(name);
        }
    }

    files.sort();
    Ok(files)
}

async fn send_line(stream: &mut TcpStream, line: &str) -> io::Result<()> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await
}

async fn send_error(stream: &mut TcpStream, code: ErrorCode, message: &str) -> io::Result<()> {
    send_line(stream, &protocol::format_error(code, message)).await
}
