mod common;

use common::{TOKEN, start_server};
use quadplay_server::SessionToken;
use quadplay_server::server::bind_with_handoff;
use quadplay_server::token::{handoff_path, write_handoff};

#[test]
fn busy_port_is_taken_over_from_previous_instance() {
    let mut previous = start_server(false);
    let port = previous.addr.port();
    let handoff = handoff_path(&previous.engine);
    write_handoff(&handoff, &SessionToken::from_string(TOKEN)).expect("write should work");

    let listener = bind_with_handoff("127.0.0.1", port, &handoff).expect("rebind should work");
    assert_eq!(listener.local_addr().expect("local addr").port(), port);

    let handle = previous.handle.take().expect("handle");
    assert!(!handle.is_running());
    handle.stop();
}

#[test]
fn busy_port_without_handoff_token_reports_in_use() {
    let previous = start_server(false);
    let port = previous.addr.port();
    let handoff = previous.dir.path().join("no-such-token.txt");

    let err = bind_with_handoff("127.0.0.1", port, &handoff).expect_err("bind should fail");
    assert!(format!("{err:#}").contains(&format!("port {port} is in use")));
    assert!(previous.handle.as_ref().is_some_and(|h| h.is_running()));
}
