//! Host and client talking over QUIC on localhost.

use skirmish_client::MatchClient;
use skirmish_net::protocol::{Move, PaintTile};
use skirmish_server::{HostSettings, LayerSpec, MatchConfig, MatchHost};
use std::time::{Duration, Instant};

fn open_settings() -> HostSettings {
    let open = LayerSpec {
        wall_density: 0.0,
        water_density: 0.0,
        ..LayerSpec::default()
    };
    HostSettings {
        match_config: MatchConfig {
            layers: vec![open],
            snapshot_interval: 1,
            ..MatchConfig::default()
        },
        ..HostSettings::default()
    }
}

fn run_until(
    host: &mut MatchHost,
    client: &mut MatchClient,
    mut done: impl FnMut(&MatchHost, &MatchClient) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let step = host.world().step_duration();
    while !done(host, client) {
        assert!(Instant::now() < deadline, "timed out waiting for match traffic");
        host.update(step);
        client.update();
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn remote_player_joins_moves_and_is_dropped_for_editor_commands() {
    let mut host = MatchHost::new(open_settings()).unwrap();
    let addr = host.listen("127.0.0.1:0".parse().unwrap()).unwrap();
    assert_eq!(host.local_addr(), Some(addr));

    let mut client = MatchClient::network(addr, &Default::default()).unwrap();
    run_until(&mut host, &mut client, |_, c| c.view().own_avatar().is_some());
    assert!(client.is_connected());
    assert!(!client.view().schema_mismatch());

    let start = *client.view().own_avatar().unwrap();
    client.send(&Move { dx: 3, dy: 0 }).unwrap();
    run_until(&mut host, &mut client, |_, c| {
        c.view().own_avatar().is_some_and(|a| a.x == start.x + 3)
    });

    client
        .send(&PaintTile { layer: 0, x: 1, y: 1, tile: 1 })
        .unwrap();
    run_until(&mut host, &mut client, |h, c| {
        c.disconnect_reason().is_some() && h.world().avatar_count() == 0
    });
    assert!(!client.is_connected());
    let painted = host.world().terrain().layer(0).unwrap().grid().get(1, 1);
    assert_ne!(painted.map(|t| t.0), Some(1));
}
