//! The control RPC surface over the sandbox's Unix socket

mod common;

use common::*;
use sentrybox::{
    control::{
        socket_path, ControlClient, ControlServer, Request, Response, Sandbox, SentryMount,
        StartContainerArgs,
    },
    memory::{AccountingClass, AllocOpts},
    state::CompressionLevel,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn start_args(id: &str) -> StartContainerArgs {
    StartContainerArgs {
        argv: vec!["/bin/sleep".to_string(), "1000".to_string()],
        working_directory: "/".to_string(),
        container_id: id.to_string(),
        mount_root_conf: Some(SentryMount {
            target: "/".to_string(),
            fs_type: "9p".to_string(),
        }),
        mount_fd: 3,
        ..Default::default()
    }
}

async fn serve_sandbox(root: &std::path::Path, id: &str) -> (Arc<Sandbox>, ControlClient) {
    let (sandbox, _started) = Sandbox::new(id, 64 << 20, 1).unwrap();
    let server = ControlServer::new(sandbox.clone());
    let (listener, path) = server.bind(root).unwrap();
    tokio::spawn(server.serve(listener));
    let client = ControlClient::connect(&path).await.unwrap();
    (sandbox, client)
}

#[test]
fn start_container_and_process_list() {
    init_logging();
    let root = tmp_dir("rpc-start");
    Runtime::new().unwrap().block_on(async {
        let (_sandbox, mut client) = serve_sandbox(&root, "s1").await;

        let response = client
            .expect_ok(&Request::StartContainer(start_args("c1")))
            .await
            .unwrap();
        let pid = match response {
            Response::Started(pid) => pid,
            other => panic!("unexpected response: {:?}", other),
        };
        assert!(pid > 0);

        match client.expect_ok(&Request::Processes).await.unwrap() {
            Response::Processes(list) => {
                assert_eq!(list.len(), 1);
                assert_eq!(list[0].cmd, "sleep");
                assert_eq!(list[0].pid, pid);
            }
            other => panic!("unexpected response: {:?}", other),
        }
    });
}

#[test]
fn pause_resume_and_usage() {
    init_logging();
    let root = tmp_dir("rpc-usage");
    Runtime::new().unwrap().block_on(async {
        let (sandbox, mut client) = serve_sandbox(&root, "s2").await;

        sandbox
            .kernel()
            .memory_file()
            .allocate(16 * 4096, AccountingClass::Anonymous, AllocOpts::empty())
            .unwrap();

        match client
            .expect_ok(&Request::Usage { full: false })
            .await
            .unwrap()
        {
            Response::Usage(stats) => {
                assert!(stats.total > 0);
                assert!(stats.mapped > 0);
                // quick stats leave the class buckets unpopulated
                assert_eq!(stats.anonymous, 0);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        match client
            .expect_ok(&Request::Usage { full: true })
            .await
            .unwrap()
        {
            Response::Usage(stats) => {
                assert_eq!(stats.anonymous, 16 * 4096);
                assert_eq!(stats.system, 0);
            }
            other => panic!("unexpected response: {:?}", other),
        }

        client.expect_ok(&Request::Pause).await.unwrap();
        assert!(sandbox.kernel().is_paused());
        client.expect_ok(&Request::Resume).await.unwrap();
        assert!(!sandbox.kernel().is_paused());
    });
}

#[test]
fn signal_and_wait() {
    init_logging();
    let root = tmp_dir("rpc-wait");
    Runtime::new().unwrap().block_on(async {
        let (_sandbox, mut client) = serve_sandbox(&root, "s3").await;

        let pid = match client
            .expect_ok(&Request::StartContainer(start_args("c1")))
            .await
            .unwrap()
        {
            Response::Started(pid) => pid,
            other => panic!("unexpected response: {:?}", other),
        };

        client
            .expect_ok(&Request::Signal {
                pid,
                signum: libc::SIGTERM,
                all: false,
            })
            .await
            .unwrap();

        match client.expect_ok(&Request::Wait { pid }).await.unwrap() {
            Response::Wait(status) => {
                assert_eq!(status.signal().map(|s| s.0), Some(libc::SIGTERM));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    });
}

#[test]
fn checkpoint_and_restore_rpc() {
    init_logging();
    let root = tmp_dir("rpc-ckpt");
    let image_dir = tmp_dir("rpc-ckpt-img");
    Runtime::new().unwrap().block_on(async {
        let (sandbox, mut client) = serve_sandbox(&root, "s4").await;

        client
            .expect_ok(&Request::StartContainer(start_args("c1")))
            .await
            .unwrap();
        let range = sandbox
            .kernel()
            .memory_file()
            .allocate(4096, AccountingClass::Anonymous, AllocOpts::empty())
            .unwrap();
        sandbox
            .kernel()
            .memory_file()
            .write_at(range.start, b"survives rpc")
            .unwrap();

        client
            .expect_ok(&Request::Checkpoint {
                dir: image_dir.clone(),
                compression: CompressionLevel::FlateDefault,
                resume: false,
            })
            .await
            .unwrap();
        assert!(sandbox.kernel().is_paused());
        assert!(image_dir.join("checkpoint.img").exists());

        client
            .expect_ok(&Request::Restore {
                dir: image_dir.clone(),
            })
            .await
            .unwrap();
        // the swapped-in kernel is running with the page contents intact
        let kernel = sandbox.kernel();
        assert!(!kernel.is_paused());
        let mut buf = [0u8; 12];
        kernel.memory_file().read_at(range.start, &mut buf).unwrap();
        assert_eq!(&buf, b"survives rpc");
    });
}

#[test]
fn errors_come_back_as_error_responses() {
    init_logging();
    let root = tmp_dir("rpc-errors");
    Runtime::new().unwrap().block_on(async {
        let (_sandbox, mut client) = serve_sandbox(&root, "s5").await;

        match client
            .call(&Request::Wait { pid: 9999 })
            .await
            .unwrap()
        {
            Response::Error(message) => assert!(message.contains("no such process")),
            other => panic!("unexpected response: {:?}", other),
        }

        // socket path is derived from the sandbox id
        assert!(socket_path(&root, "s5").ends_with("s5.sock"));
    });
}
