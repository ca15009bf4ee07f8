use skirmish_client::Client;
use skirmish_net::protocol::Move;
use skirmish_net::SimTick;

#[test]
fn singleplayer_match_runs_and_replicates() {
    let mut game = Client::singleplayer().expect("match starts");
    let step = game.host().world().step_duration();

    game.frame(step);
    let start = game.client().view().own_avatar().copied().expect("avatar replicated");
    game.client_mut().send(&Move { dx: 0, dy: 0 }).expect("send succeeds");

    for _ in 0..50 {
        game.frame(step);
    }
    assert_eq!(game.host().tick(), SimTick(51));
    assert!(game.client().view().server_tick().is_some_and(|t| t > SimTick(40)));
    let now = game.client().view().own_avatar().copied().expect("avatar still replicated");
    assert_eq!((now.x, now.y), (start.x, start.y));
}

#[test]
fn large_elapsed_runs_whole_steps() {
    let mut game = Client::singleplayer().expect("match starts");
    let step = game.host().world().step_duration();
    let frame = game.frame(step * 5 + step / 3);
    assert_eq!(frame.steps, 5);
    assert_eq!(game.host().world().pending_time(), step / 3);
}
