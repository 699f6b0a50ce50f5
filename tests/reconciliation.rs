//! Two nodes on loopback converging through snapshot gossip.

use std::sync::Arc;
use std::time::Duration;

use duochain::blockchain::{is_chain_valid, AdmissionPolicy};
use duochain::ledger::Ledger;
use duochain::network::NetworkNode;
use duochain::shutdown::Shutdown;
use duochain::sync::{ChainSynchronizer, SyncMessage, MAX_PEER_FAILURES};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const POLICY: AdmissionPolicy = AdmissionPolicy::ProofOfWork { difficulty: 1 };
const INTERVAL: Duration = Duration::from_millis(50);

struct TestPeer {
    ledger: Ledger,
    sync: Arc<ChainSynchronizer>,
    network: Arc<NetworkNode>,
}

fn spawn_peer(shutdown: &Shutdown) -> TestPeer {
    let ledger = Ledger::new(POLICY);
    let sync = Arc::new(ChainSynchronizer::new(ledger.clone()));
    sync.clone().spawn_publisher(INTERVAL, shutdown.clone());
    let network = Arc::new(NetworkNode::new(sync.clone(), shutdown.clone()));
    TestPeer { ledger, sync, network }
}

async fn wait_for_len(ledger: &Ledger, len: usize) {
    while ledger.len() < len {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nodes_converge_on_longest_chain() {
    tokio::time::timeout(Duration::from_secs(20), async {
        let shutdown = Shutdown::new();
        let a = spawn_peer(&shutdown);
        let b = spawn_peer(&shutdown);

        for payload in [1, 2, 3] {
            a.ledger.submit_data(payload, None).unwrap();
        }

        let listener = NetworkNode::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(a.network.clone().start_server(listener));
        b.network.clone().connect_peer(&addr).await.unwrap();

        // snapshot on connect brings b up to date
        wait_for_len(&b.ledger, 4).await;
        assert_eq!(b.ledger.current_chain(), a.ledger.current_chain());

        // b extends, a follows on the next publish
        b.ledger.submit_data(4, None).unwrap();
        wait_for_len(&a.ledger, 5).await;
        assert_eq!(a.ledger.current_chain(), b.ledger.current_chain());
        assert!(is_chain_valid(&a.ledger.current_chain()).is_ok());

        assert_eq!(a.sync.peer_count().await, 1);
        assert!(b.sync.get_stats().await.chains_adopted >= 1);

        shutdown.trigger();
    })
    .await
    .expect("test_nodes_converge_on_longest_chain timed out");
}

#[tokio::test]
async fn test_garbage_peer_is_dropped() {
    tokio::time::timeout(Duration::from_secs(10), async {
        let shutdown = Shutdown::new();
        let a = spawn_peer(&shutdown);
        a.ledger.submit_data(1, None).unwrap();

        let listener = NetworkNode::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(a.network.clone().start_server(listener));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        let first = lines.next_line().await.unwrap().unwrap();
        assert!(matches!(SyncMessage::decode(&first).unwrap(), SyncMessage::Chain { .. }));

        for _ in 0..MAX_PEER_FAILURES {
            writer.write_all(b"{\"type\":\"chain\",\"blocks\":\"nope\"}\n").await.unwrap();
        }
        writer.flush().await.unwrap();

        // the node hangs up; anything it published meanwhile is drained first
        while let Ok(Some(_)) = lines.next_line().await {}

        assert_eq!(a.ledger.len(), 2);
        assert_eq!(a.sync.peer_count().await, 0);
        shutdown.trigger();
    })
    .await
    .expect("test_garbage_peer_is_dropped timed out");
}
