mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::{TOKEN, get, post, request, start_server, write};
use serde_json::json;
use std::fs;
use std::thread;
use std::time::Duration;

#[test]
fn text_write_round_trips_through_get() {
    let server = start_server(false);
    let contents = "# Notes\n\nUnicode survives: \u{263A}\n";
    let reply = post(
        server.addr,
        json!({
            "command": "write_file",
            "token": TOKEN,
            "url": "/work/pong/notes.md",
            "encoding": "utf8",
            "contents": contents,
        }),
    );
    assert_eq!(reply.status, 201);
    assert_eq!(reply.json(), json!("OK"));

    let fetched = get(server.addr, "/work/pong/notes.md");
    assert_eq!(fetched.status, 200);
    assert_eq!(fetched.body, contents.as_bytes());
}

#[test]
fn binary_write_round_trips_through_get() {
    let server = start_server(false);
    let bytes: Vec<u8> = vec![0x89, b'P', b'N', b'G', 0, 159, 146, 150, 255];
    let reply = post(
        server.addr,
        json!({
            "command": "write_file",
            "token": TOKEN,
            "url": "/work/pong/sprites.png",
            "encoding": "binary",
            "contents": STANDARD.encode(&bytes),
        }),
    );
    assert_eq!(reply.status, 201);

    let fetched = get(server.addr, "/work/pong/sprites.png");
    assert_eq!(fetched.status, 200);
    assert_eq!(fetched.body, bytes);
    assert!(fetched.headers.contains("Content-Type: image/png"));
}

#[test]
fn wrong_token_is_rejected_before_any_side_effect() {
    let server = start_server(false);
    for token in ["", "0123456789abcde", "0123456789ABCDEF", "0123456789abcdef0"] {
        let reply = post(
            server.addr,
            json!({
                "command": "write_file",
                "token": token,
                "url": "/work/pong/notes.md",
                "encoding": "utf8",
                "contents": "x",
            }),
        );
        assert_eq!(reply.status, 403);
        assert_eq!(reply.json(), json!("Bad token"));
    }
    assert!(!server.game.join("notes.md").exists());

    let missing = request(server.addr, "DELETE", "/work/pong/Play.pyxl", "{}");
    assert_eq!(missing.status, 403);
    assert!(server.game.join("Play.pyxl").exists());
}

#[test]
fn writes_outside_allowlist_or_with_bad_extension_are_illegal() {
    let server = start_server(false);
    for url in ["/etc/x.json", "/work/pong/../../x.json", "/work/pong/run.sh"] {
        let reply = post(
            server.addr,
            json!({
                "command": "write_file",
                "token": TOKEN,
                "url": url,
                "encoding": "utf8",
                "contents": "x",
            }),
        );
        assert_eq!(reply.status, 403, "{url}");
        assert_eq!(reply.json(), json!("Illegal"));
    }
    assert!(!server.dir.path().join("x.json").exists());
}

#[test]
fn delete_removes_allowlisted_file() {
    let server = start_server(false);
    let body = json!({ "token": TOKEN }).to_string();
    let reply = request(server.addr, "DELETE", "/work/pong/Play.pyxl", &body);
    assert_eq!(reply.status, 200);
    assert!(!server.game.join("Play.pyxl").exists());

    assert_eq!(get(server.addr, "/work/pong/Play.pyxl").status, 404);
}

#[test]
fn new_game_copies_template_once() {
    let server = start_server(false);
    let command = json!({
        "command": "new_game",
        "token": TOKEN,
        "dir_name": "rocket",
        "game_name": "Rocket Race",
        "src_url": "quad://examples/starter/",
    });

    let first = post(server.addr, command.clone());
    assert_eq!(first.status, 201);
    assert_eq!(first.json(), json!({ "game": "/my_quadplay/rocket/" }));

    let rocket = server.library.join("rocket");
    let manifest = fs::read_to_string(rocket.join("rocket.game.json")).expect("manifest");
    let parsed: serde_json::Value = serde_json::from_str(&manifest).expect("strict JSON");
    assert_eq!(parsed["title"], "Rocket Race");
    assert_eq!(parsed["screenshot_tag"], "Rocket Race");
    assert_eq!(parsed["version"], 1);
    assert!(manifest.contains("\n    \"title\""));
    assert!(!rocket.join("starter.game.json").exists());
    assert!(!rocket.join("Play.pyxl~").exists());
    assert!(rocket.join("Play.pyxl").exists());
    assert!(rocket.join(".gitignore").exists());

    fs::write(rocket.join("Play.pyxl"), "// edited").expect("write should work");
    let second = post(server.addr, command);
    assert_eq!(second.status, 406);
    assert_eq!(
        second.json(),
        json!({ "message": "my_quadplay/rocket already exists" })
    );
    assert_eq!(
        fs::read_to_string(rocket.join("Play.pyxl")).expect("read"),
        "// edited"
    );
    assert_eq!(fs::read_to_string(rocket.join("rocket.game.json")).expect("read"), manifest);
}

#[test]
fn new_game_refuses_nested_directory_names() {
    let server = start_server(false);
    let reply = post(
        server.addr,
        json!({
            "command": "new_game",
            "token": TOKEN,
            "dir_name": "../escape",
            "game_name": "Escape",
            "src_url": "quad://examples/starter/",
        }),
    );
    assert_eq!(reply.status, 403);
    assert!(!server.dir.path().join("escape").exists());
}

#[test]
fn concurrent_update_requests_start_one_task() {
    let server = start_server(false);
    let update = json!({ "command": "update", "token": TOKEN });

    let first = post(server.addr, update.clone());
    let second = post(server.addr, update.clone());
    assert_eq!(first.json(), json!("OK"));
    assert_eq!(second.json(), json!("Update already in progress."));

    let progress = get(server.addr, "/quadplay/console/_update_progress.json").json();
    assert_eq!(progress["status"], "Running");
    assert_eq!(progress["done"], false);

    server.release_update.send(true).expect("release should work");
    let mut finished = None;
    for _ in 0..200 {
        let progress = get(server.addr, "/quadplay/console/_update_progress.json").json();
        if progress["done"] == true {
            finished = Some(progress);
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    let finished = finished.expect("update should finish");
    assert_eq!(finished["status"], "Done. Restart server.");
    assert_eq!(finished["restartServer"], true);

    assert_eq!(post(server.addr, update).json(), json!("OK"));
}

#[test]
fn export_reports_status_by_outcome() {
    let server = start_server(false);
    let export = |path: &str| {
        post(
            server.addr,
            json!({
                "command": "export_game",
                "token": TOKEN,
                "game_path": path,
                "target": "standalone",
            }),
        )
    };

    assert_eq!(export("").status, 400);
    assert_eq!(export("/work/pong/missing.game.json").status, 404);

    let ok = export("/work/pong/pong.game.json");
    assert_eq!(ok.status, 200);
    assert_eq!(ok.json(), json!({ "status": "success" }));

    let requests = server.exporter.requests.lock().expect("lock");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].archive, server.game.join("pong.zip"));
    let revealed = server.host.revealed.lock().expect("lock");
    assert_eq!(revealed.as_slice(), [server.game.join("pong.zip")]);
}

#[test]
fn exporter_failure_is_internal_error() {
    let server = start_server(true);
    let reply = post(
        server.addr,
        json!({
            "command": "export_game",
            "token": TOKEN,
            "game_path": "/work/pong/pong.game.json",
        }),
    );
    assert_eq!(reply.status, 500);
    assert!(reply.json()["error"].as_str().expect("error").contains("exploded"));
}

#[test]
fn reads_are_confined_to_allowlist() {
    let server = start_server(false);
    write(&server.dir.path().join("work/pong2/secret.txt"), "secret");
    write(&server.dir.path().join("secret.txt"), "secret");

    assert_eq!(get(server.addr, "/work/pong2/secret.txt").status, 403);
    assert_eq!(get(server.addr, "/secret.txt").status, 403);
    assert_eq!(get(server.addr, "/work/pong/../../secret.txt").status, 403);
    assert_eq!(get(server.addr, "/work/pong/Play.pyxl").status, 200);
    assert_eq!(get(server.addr, "/work/pong/").status, 404);
}

#[test]
fn responses_carry_isolation_headers() {
    let server = start_server(false);
    let reply = get(server.addr, "/work/pong/Play.pyxl");
    assert!(reply.headers.contains("Access-Control-Allow-Origin: *"));
    assert!(reply.headers.contains("Cross-Origin-Embedder-Policy: require-corp"));
    assert!(reply.headers.contains("Cross-Origin-Opener-Policy: same-origin"));
    assert!(reply.headers.contains("Cache-Control: must-revalidate"));
    assert!(reply.headers.contains("Content-Length: 7"));
}

#[test]
fn favicon_alias_bypasses_allowlist() {
    let server = start_server(false);
    let reply = get(server.addr, "/favicon.ico");
    assert_eq!(reply.status, 200);
    assert_eq!(reply.text(), "ICO");
}

#[test]
fn listing_endpoints_revalidate_aux_path() {
    let server = start_server(false);
    let scripts = get(
        server.addr,
        "/quadplay/console/_scripts.json?aux_webpath=/work/pong/",
    );
    assert_eq!(scripts.status, 200);
    assert_eq!(scripts.json(), json!(["work/pong/Play.pyxl"]));

    let escaped = get(
        server.addr,
        "/quadplay/console/_assets.json?aux_webpath=/work/pong/../../",
    );
    assert_eq!(escaped.status, 403);

    let games = get(server.addr, "/quadplay/console/games.json").json();
    assert_eq!(games["examples"][0]["url"], "quad://examples/starter/");
    assert_eq!(games["mine"], json!([]));

    let config = get(server.addr, "/quadplay/console/_config.json").json();
    assert_eq!(config["hasGit"], false);
    assert_eq!(config["hasFinder"], false);
    assert!(config.get("applications").is_none());
}

#[test]
fn git_passthrough_without_git_is_not_found() {
    let server = start_server(false);
    assert_eq!(get(server.addr, "/work/pong/_git?status").status, 404);
}

#[test]
fn quit_stops_the_listener() {
    let mut server = start_server(false);
    let reply = post(server.addr, json!({ "command": "quit", "token": TOKEN }));
    assert_eq!(reply.status, 201);

    let handle = server.handle.take().expect("handle");
    for _ in 0..100 {
        if !handle.is_running() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!handle.is_running());
    handle.stop();
}
