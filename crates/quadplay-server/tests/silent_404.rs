mod common;

use common::{get, start_server};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::sync::Mutex;

struct Capture {
    lines: Mutex<Vec<String>>,
}

impl Log for Capture {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= Level::Warn
    }

    fn log(&self, record: &Record<'_>) {
        if self.enabled(record.metadata()) {
            self.lines
                .lock()
                .expect("lock should work")
                .push(record.args().to_string());
        }
    }

    fn flush(&self) {}
}

static CAPTURE: Capture = Capture {
    lines: Mutex::new(Vec::new()),
};

fn take_lines() -> Vec<String> {
    std::mem::take(&mut *CAPTURE.lines.lock().expect("lock should work"))
}

#[test]
fn optional_files_miss_without_warning() {
    log::set_logger(&CAPTURE).expect("logger should install");
    log::set_max_level(LevelFilter::Warn);
    let server = start_server(false);

    for path in [
        "/work/pong/label64.png",
        "/work/pong/label128.png",
        "/work/pong/pong.debug.json",
    ] {
        let reply = get(server.addr, path);
        assert_eq!(reply.status, 404, "{path}");
        assert!(reply.body.is_empty());
    }
    assert_eq!(take_lines(), Vec::<String>::new());

    let reply = get(server.addr, "/work/pong/missing.png");
    assert_eq!(reply.status, 404);
    let lines = take_lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("/work/pong/missing.png"));
}
