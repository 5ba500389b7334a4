use std::{thread, time::Duration};

use fluent_detect::{
    config::{LofConfig, PartitionConfig},
    service::service,
    state::MemoryStore,
    streamer::*,
    updater::LofUpdater,
};
use tungstenite::{connect, Message};
use url::Url;

use utilities::{assert_lof_results, get_point_iter};

#[test]
fn test_service() {
    let (points, write) = service("127.0.0.1:9042").unwrap();
    thread::spawn(move || {
        let partition = PartitionConfig::default();
        let mut updater =
            LofUpdater::new(LofConfig::default(), &partition, MemoryStore::new(0)).unwrap();
        let streamer = Streamer::new(points, write, 10);
        Streamer::run(streamer, &mut updater).unwrap();
    });
    let results_url = "ws://127.0.0.1:9042/ws/results";
    let (mut results_socket, _resp) =
        connect(Url::parse(results_url).unwrap()).expect("Can't connect");
    thread::sleep(Duration::from_millis(200));
    thread::spawn(|| {
        let points_url = "ws://127.0.0.1:9042/ws/points";
        let (mut points_socket, _resp) =
            connect(Url::parse(points_url).unwrap()).expect("Can't connect");
        for p in get_point_iter(300) {
            points_socket
                .write_message(Message::Text(p.unwrap()))
                .unwrap();
        }
        points_socket.close(None).unwrap();
    });
    let mut result: Vec<String> = vec![];
    for _i in 0..300 {
        let m = results_socket.read_message().unwrap();
        result.push(m.into_text().unwrap());
    }
    assert_lof_results(result, 300);
    results_socket.close(None).unwrap();
}
