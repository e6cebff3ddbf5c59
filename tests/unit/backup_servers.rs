//! Backup server factory and configuration tests

use che_operator::backup::{BackupServer, resolve_backup_server};
use che_operator::crd::{
    AwsS3ServerConfig, BackupServerType, BackupServersConfigs, RestServerConfig, SftpServerConfig,
};

fn rest_config() -> RestServerConfig {
    RestServerConfig {
        hostname: "backup.example.com".to_string(),
        ..Default::default()
    }
}

fn sftp_config() -> SftpServerConfig {
    SftpServerConfig {
        username: "backup".to_string(),
        hostname: "sftp.example.com".to_string(),
        repo: "/srv/backups".to_string(),
        ssh_key_secret_ref: "sftp-key".to_string(),
        ..Default::default()
    }
}

#[test]
fn test_no_variant_configured() {
    let err = resolve_backup_server(&BackupServersConfigs::default(), None).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid backup server configuration: at least one backup server should be configured"
    );
}

#[test]
fn test_sole_variant_selected_implicitly() {
    let servers = BackupServersConfigs {
        sftp: Some(sftp_config()),
        ..Default::default()
    };
    assert!(resolve_backup_server(&servers, None).is_ok());
}

#[test]
fn test_two_variants_require_explicit_type() {
    let servers = BackupServersConfigs {
        rest: Some(rest_config()),
        sftp: Some(sftp_config()),
        ..Default::default()
    };
    let err = resolve_backup_server(&servers, None).unwrap_err();
    assert!(err.to_string().contains("2 backup servers configured"));

    assert!(resolve_backup_server(&servers, Some(BackupServerType::Rest)).is_ok());
    assert!(resolve_backup_server(&servers, Some(BackupServerType::Sftp)).is_ok());
}

#[test]
fn test_selected_variant_must_be_configured() {
    let servers = BackupServersConfigs {
        rest: Some(rest_config()),
        ..Default::default()
    };
    let err = resolve_backup_server(&servers, Some(BackupServerType::AwsS3)).unwrap_err();
    assert!(err.to_string().contains("not configured"));
}

#[test]
fn test_configured_lists_variants_in_order() {
    let servers = BackupServersConfigs {
        rest: Some(rest_config()),
        sftp: Some(sftp_config()),
        awss3: Some(AwsS3ServerConfig {
            repo: "bucket/repo".to_string(),
            ..Default::default()
        }),
    };
    assert_eq!(
        servers.configured(),
        vec![
            BackupServerType::Rest,
            BackupServerType::Sftp,
            BackupServerType::AwsS3
        ]
    );
}

#[test]
fn test_unprepared_server_has_no_client() {
    let servers = BackupServersConfigs {
        rest: Some(rest_config()),
        ..Default::default()
    };
    let server = resolve_backup_server(&servers, None).unwrap();
    // Repository operations require prepare_configuration first
    assert!(server.restic().is_err());
}
