use serde_pickle::Value as PickleValue;
use slsk_transfers::config::DownloadFilter;
use slsk_transfers::network::{
    InboundMessage, OutboundMessage, PeerMessage, SocketHandle, TransferDirection,
};
use slsk_transfers::service::TransferCoordinator;
use slsk_transfers::testing::Harness;
use slsk_transfers::transfer::download::FileRequest;
use slsk_transfers::transfer::persistence::{self, LEGACY_DOWNLOADS_FILE};
use slsk_transfers::transfer::{DownloadFilterEngine, TransferStatus};

fn coordinator(harness: &Harness) -> TransferCoordinator {
    let mut coordinator = TransferCoordinator::new(harness.ctx.clone());
    coordinator.dispatch(InboundMessage::ServerLogin { success: true });
    coordinator
}

fn download_status(coordinator: &TransferCoordinator, user: &str, virtual_path: &str) -> TransferStatus {
    coordinator
        .downloads()
        .find(user, virtual_path)
        .unwrap()
        .status()
        .clone()
}

fn upload_request(user: &str, token: u32, virtual_path: &str) -> InboundMessage {
    InboundMessage::TransferRequest {
        user: user.into(),
        addr: None,
        direction: TransferDirection::Upload,
        token,
        virtual_path: virtual_path.into(),
        size: 1000,
    }
}

fn write_partial(coordinator: &TransferCoordinator, user: &str, virtual_path: &str, len: usize) {
    let path = coordinator
        .downloads()
        .incomplete_download_path(user, virtual_path);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, vec![0u8; len]).unwrap();
}

#[test]
fn test_download_end_to_end() {
    let mut harness = Harness::new();
    let mut coordinator = coordinator(&harness);

    coordinator
        .downloads_mut()
        .request_file(FileRequest::new("alice", "music\\track.mp3").size(1000));
    assert_eq!(download_status(&coordinator, "alice", "music\\track.mp3"), TransferStatus::Queued);

    coordinator.dispatch(upload_request("alice", 7, "music\\track.mp3"));
    assert_eq!(
        download_status(&coordinator, "alice", "music\\track.mp3"),
        TransferStatus::GettingStatus
    );

    coordinator.dispatch(InboundMessage::FileDownloadInit {
        user: "alice".into(),
        token: 7,
        socket: SocketHandle(1),
    });
    let record = coordinator.downloads().find("alice", "music\\track.mp3").unwrap();
    assert_eq!(record.status(), &TransferStatus::Transferring);
    assert_eq!(record.current_offset(), Some(0));

    for _ in 0..4 {
        coordinator.dispatch(InboundMessage::DownloadData {
            user: "alice".into(),
            token: 7,
            data: vec![1u8; 250],
        });
    }
    coordinator.dispatch(InboundMessage::DownloadProgress {
        user: "alice".into(),
        token: 7,
        bytes_left: 0,
    });
    coordinator.dispatch(InboundMessage::DownloadConnectionClosed {
        user: "alice".into(),
        token: 7,
    });

    let record = coordinator.downloads().find("alice", "music\\track.mp3").unwrap();
    assert_eq!(record.status(), &TransferStatus::Finished);
    assert_eq!(record.current_offset(), Some(1000));

    let destination = harness.ctx.settings.transfers.download_dir.join("track.mp3");
    assert_eq!(std::fs::metadata(destination).unwrap().len(), 1000);

    let messages = harness.drain_messages();
    assert!(messages.contains(&OutboundMessage::Peer {
        user: "alice".into(),
        message: PeerMessage::allow(7, None),
    }));
    assert!(messages.contains(&OutboundMessage::DownloadFile {
        socket: SocketHandle(1),
        token: 7,
        bytes_left: 1000,
    }));
}

#[test]
fn test_resume_from_partial_file() {
    let mut harness = Harness::new();
    let mut coordinator = coordinator(&harness);

    coordinator
        .downloads_mut()
        .request_file(FileRequest::new("alice", "music\\track.mp3").size(1000));
    write_partial(&coordinator, "alice", "music\\track.mp3", 400);
    coordinator.dispatch(upload_request("alice", 3, "music\\track.mp3"));
    harness.drain_messages();

    coordinator.dispatch(InboundMessage::FileDownloadInit {
        user: "alice".into(),
        token: 3,
        socket: SocketHandle(2),
    });

    let record = coordinator.downloads().find("alice", "music\\track.mp3").unwrap();
    assert_eq!(record.current_offset(), Some(400));
    assert_eq!(
        harness.drain_messages(),
        vec![
            OutboundMessage::DownloadFile {
                socket: SocketHandle(2),
                token: 3,
                bytes_left: 600,
            },
            OutboundMessage::FileOffset {
                socket: SocketHandle(2),
                offset: 400,
            },
        ]
    );

    let partial = coordinator
        .downloads()
        .incomplete_download_path("alice", "music\\track.mp3");
    assert_eq!(std::fs::metadata(partial).unwrap().len(), 400);
}

#[test]
fn test_changed_size_restarts_from_zero() {
    let harness = Harness::new();
    let mut coordinator = coordinator(&harness);

    coordinator
        .downloads_mut()
        .request_file(FileRequest::new("alice", "music\\track.mp3").size(500));
    write_partial(&coordinator, "alice", "music\\track.mp3", 400);
    coordinator.dispatch(upload_request("alice", 3, "music\\track.mp3"));

    coordinator.dispatch(InboundMessage::FileDownloadInit {
        user: "alice".into(),
        token: 3,
        socket: SocketHandle(2),
    });

    let record = coordinator.downloads().find("alice", "music\\track.mp3").unwrap();
    assert_eq!(record.size(), 1000);
    assert_eq!(record.current_offset(), Some(0));

    let partial = coordinator
        .downloads()
        .incomplete_download_path("alice", "music\\track.mp3");
    assert_eq!(std::fs::metadata(partial).unwrap().len(), 0);
}

#[test]
fn test_abort_is_idempotent() {
    let mut harness = Harness::new();
    let mut coordinator = coordinator(&harness);

    let id = coordinator
        .downloads_mut()
        .request_file(FileRequest::new("alice", "music\\track.mp3").size(1000))
        .unwrap();
    coordinator.dispatch(upload_request("alice", 3, "music\\track.mp3"));
    coordinator.dispatch(InboundMessage::FileDownloadInit {
        user: "alice".into(),
        token: 3,
        socket: SocketHandle(9),
    });
    harness.drain_messages();

    coordinator
        .downloads_mut()
        .abort(id, Some(TransferStatus::Paused), true);
    coordinator
        .downloads_mut()
        .abort(id, Some(TransferStatus::Paused), true);

    let record = coordinator.downloads().get(id).unwrap();
    assert_eq!(record.socket(), None);
    assert!(!record.has_file());
    assert_eq!(record.token(), None);
    assert_eq!(
        harness.drain_messages(),
        vec![OutboundMessage::CloseConnection {
            socket: SocketHandle(9)
        }]
    );
}

#[test]
fn test_requesting_twice_keeps_one_record() {
    let harness = Harness::new();
    let mut coordinator = coordinator(&harness);

    let first = coordinator
        .downloads_mut()
        .request_file(FileRequest::new("alice", "music\\track.mp3").size(10));
    let second = coordinator
        .downloads_mut()
        .request_file(FileRequest::new("alice", "music\\track.mp3").size(10));

    assert_eq!(first, second);
    assert_eq!(coordinator.downloads().transfers().len(), 1);
}

#[test]
fn test_filter_composition() {
    let filters = DownloadFilterEngine::compile(&[DownloadFilter {
        pattern: "\\.exe$".into(),
        escaped: false,
    }]);

    assert!(filters.is_filtered("song.exe"));
    assert!(!filters.is_filtered("song.mp3"));
}

#[test]
fn test_upload_queue_limit_per_user() {
    let mut harness = Harness::with_settings(|settings| {
        settings.transfers.upload_slots = 1;
        settings.transfers.file_limit = 2;
    });
    for path in ["dave\\busy.mp3", "bob\\1.mp3", "bob\\2.mp3", "bob\\3.mp3", "carol\\1.mp3"] {
        harness.share_file(path, b"data");
    }
    let mut coordinator = coordinator(&harness);

    for (user, path) in [("dave", "dave\\busy.mp3"), ("bob", "bob\\1.mp3"), ("bob", "bob\\2.mp3")] {
        coordinator.dispatch(InboundMessage::QueueUpload {
            user: user.into(),
            addr: None,
            virtual_path: path.into(),
        });
    }
    harness.drain_messages();

    coordinator.dispatch(InboundMessage::QueueUpload {
        user: "bob".into(),
        addr: None,
        virtual_path: "bob\\3.mp3".into(),
    });
    coordinator.dispatch(InboundMessage::QueueUpload {
        user: "carol".into(),
        addr: None,
        virtual_path: "carol\\1.mp3".into(),
    });

    assert_eq!(
        harness.peer_messages("bob"),
        vec![PeerMessage::UploadDenied {
            virtual_path: "bob\\3.mp3".into(),
            reason: "Too many files".into(),
        }]
    );
    assert!(coordinator.uploads().find("bob", "bob\\3.mp3").is_none());
    assert_eq!(
        coordinator.uploads().find("carol", "carol\\1.mp3").unwrap().status(),
        &TransferStatus::Queued
    );
}

#[test]
fn test_round_robin_and_privileges() {
    let mut harness = Harness::with_settings(|settings| {
        settings.transfers.upload_slots = 1;
    });
    for path in ["a\\1.mp3", "b\\1.mp3", "c\\1.mp3", "d\\1.mp3"] {
        harness.share_file(path, b"data");
    }
    let mut coordinator = coordinator(&harness);

    for (user, path) in [("alice", "a\\1.mp3"), ("bob", "b\\1.mp3"), ("carol", "c\\1.mp3"), ("dave", "d\\1.mp3")] {
        coordinator.dispatch(InboundMessage::QueueUpload {
            user: user.into(),
            addr: None,
            virtual_path: path.into(),
        });
    }
    coordinator.dispatch(InboundMessage::UserStatus {
        user: "dave".into(),
        status: slsk_transfers::network::UserStatus::Online,
        privileged: Some(true),
    });

    let mut served = Vec::new();
    for _ in 0..4 {
        let (user, token) = harness
            .drain_messages()
            .into_iter()
            .find_map(|message| match message {
                OutboundMessage::Peer {
                    user,
                    message: PeerMessage::TransferRequest { token, .. },
                } => Some((user, token)),
                _ => None,
            })
            .unwrap();

        coordinator.dispatch(InboundMessage::TransferResponse {
            user: user.clone(),
            token,
            allowed: false,
            reason: Some("Complete".into()),
            size: None,
        });
        served.push(user);
    }

    // alice started before dave's privileges were known
    assert_eq!(served, vec!["alice", "dave", "bob", "carol"]);
}

#[test]
fn test_legacy_download_list_is_migrated() {
    let harness = Harness::new();
    let data_dir = harness.ctx.settings.data_dir().unwrap();
    std::fs::create_dir_all(&data_dir).unwrap();

    let row = PickleValue::List(vec![
        PickleValue::String("alice".into()),
        PickleValue::String("music\\a.mp3".into()),
        PickleValue::String(String::new()),
        PickleValue::String("Transferring".into()),
        PickleValue::I64(1000),
        PickleValue::I64(250),
        PickleValue::String("320".into()),
        PickleValue::String("03:30".into()),
    ]);
    let content =
        serde_pickle::value_to_vec(&PickleValue::List(vec![row]), serde_pickle::SerOptions::new())
            .unwrap();
    std::fs::write(data_dir.join(LEGACY_DOWNLOADS_FILE), content).unwrap();

    let mut coordinator = TransferCoordinator::new(harness.ctx.clone());
    coordinator.load_transfers().unwrap();

    let record = coordinator.downloads().find("alice", "music\\a.mp3").unwrap();
    assert_eq!(record.status(), &TransferStatus::UserLoggedOff);
    assert_eq!(record.current_offset(), Some(250));

    coordinator.save_transfers().unwrap();
    assert_eq!(
        persistence::download_list_path(&data_dir),
        data_dir.join(persistence::DOWNLOADS_FILE)
    );

    let reloaded = persistence::load_transfers(&data_dir.join(persistence::DOWNLOADS_FILE)).unwrap();
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded[0].size, 1000);
}
