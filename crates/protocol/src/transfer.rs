use serde::{Deserialize, Serialize};

/// File-channel messages.
///
/// The same shapes appear in two places: as the JSON header embedded in a
/// reassembled binary blob (`file_download` / `file_upload`), and as text
/// frames on the `file_text_airan` channel (directory markers, listings,
/// upload results). The wire form is a flat object discriminated by
/// `msgType`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "msgType")]
pub enum FileMessage {
    /// Client → controller payload, or a directory marker for one.
    #[serde(rename = "file_download")]
    Download(TransferHeader),
    /// Controller → client payload, or a directory marker for one.
    #[serde(rename = "file_upload")]
    Upload(TransferHeader),
    /// Directory listing request (controller → client, `path` only) and
    /// response (client → controller, all fields).
    #[serde(rename = "file_list")]
    FileList {
        #[serde(default)]
        path: String,
        #[serde(rename = "folderFiles", default, skip_serializing_if = "Vec::is_empty")]
        folder_files: Vec<FileEntry>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        mounted: Vec<String>,
    },
    /// Per-file upload outcome, client → controller.
    #[serde(rename = "upload_file_res")]
    UploadRes {
        #[serde(default)]
        path_cli: String,
        status: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// The transfer header: paths on both ends plus directory framing flags.
///
/// `file_size` is authoritative for how many payload bytes follow the header
/// in the logical blob; trailing zero padding from the last fragment is
/// ignored because of it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferHeader {
    #[serde(default)]
    pub path_cli: String,
    #[serde(default)]
    pub path_ctl: String,
    #[serde(default)]
    pub file_size: i64,
    #[serde(rename = "isDirectory", default)]
    pub is_directory: bool,
    #[serde(rename = "directoryStart", default, skip_serializing_if = "is_false")]
    pub directory_start: bool,
    #[serde(rename = "directoryEnd", default, skip_serializing_if = "is_false")]
    pub directory_end: bool,
    #[serde(rename = "fileCount", default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u64>,
    /// Set on text-channel error reports (e.g. requested path missing).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// One row of a directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "is_dir")]
    pub is_dir: bool,
    #[serde(default)]
    pub file_size: i64,
    #[serde(default)]
    pub file_last_mod_time: String,
}

/// Path keyword selecting the user's home directory in `file_list` requests.
pub const FOLDER_HOME: &str = "home";

#[cfg(test)]
mod tests {
    use super::*;

    /// The upload header shape used in the logical blob, byte layout per the
    /// framing contract.
    #[test]
    fn upload_header_shape() {
        let header = FileMessage::Upload(TransferHeader {
            path_ctl: "C:\\a.txt".into(),
            path_cli: "/tmp/a.txt".into(),
            file_size: 5,
            is_directory: false,
            ..Default::default()
        });
        let json = serde_json::to_string(&header).unwrap();
        assert!(json.contains(r#""msgType":"file_upload""#));
        assert!(json.contains(r#""path_cli":"/tmp/a.txt""#));
        assert!(json.contains(r#""file_size":5"#));
        assert!(json.contains(r#""isDirectory":false"#));
        // The directory framing keys stay off non-directory transfers.
        assert!(!json.contains("directoryStart"));
        assert!(!json.contains("directoryEnd"));

        let parsed: FileMessage = serde_json::from_str(&json).unwrap();
        match parsed {
            FileMessage::Upload(h) => {
                assert_eq!(h.path_cli, "/tmp/a.txt");
                assert_eq!(h.path_ctl, "C:\\a.txt");
                assert_eq!(h.file_size, 5);
            }
            other => panic!("expected Upload, got {other:?}"),
        }
    }

    #[test]
    fn directory_markers() {
        let start = FileMessage::Download(TransferHeader {
            path_cli: "/data/photos".into(),
            path_ctl: "/home/op/photos".into(),
            is_directory: true,
            directory_start: true,
            ..Default::default()
        });
        let json = serde_json::to_string(&start).unwrap();
        assert!(json.contains(r#""directoryStart":true"#));

        let end: FileMessage = serde_json::from_str(
            r#"{"msgType":"file_download","path_cli":"/data/photos",
                "path_ctl":"/home/op/photos","isDirectory":true,
                "directoryEnd":true,"fileCount":12}"#,
        )
        .unwrap();
        match end {
            FileMessage::Download(h) => {
                assert!(h.directory_end);
                assert_eq!(h.file_count, Some(12));
            }
            other => panic!("expected Download, got {other:?}"),
        }
    }

    #[test]
    fn file_list_request_and_response() {
        let req: FileMessage =
            serde_json::from_str(r#"{"msgType":"file_list","path":"home"}"#).unwrap();
        match req {
            FileMessage::FileList { path, folder_files, .. } => {
                assert_eq!(path, FOLDER_HOME);
                assert!(folder_files.is_empty());
            }
            other => panic!("expected FileList, got {other:?}"),
        }

        let res = FileMessage::FileList {
            path: "/home/op".into(),
            folder_files: vec![FileEntry {
                name: "notes.txt".into(),
                is_dir: false,
                file_size: 120,
                file_last_mod_time: "2025-11-02T10:00:00".into(),
            }],
            mounted: vec!["/".into()],
        };
        let json = serde_json::to_string(&res).unwrap();
        assert!(json.contains(r#""folderFiles""#));
        assert!(json.contains(r#""mounted":["/"]"#));
    }

    #[test]
    fn upload_res_roundtrip() {
        let msg = FileMessage::UploadRes {
            path_cli: "/tmp/a.txt".into(),
            status: true,
            message: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""msgType":"upload_file_res""#));
        assert!(json.contains(r#""status":true"#));
        assert!(!json.contains("message"));
    }
}
