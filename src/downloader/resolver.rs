//! 频道解析与文件命名
//!
//! 负责：
//! - 将运行时会话ID / 用户名映射到账号下保存的频道记录
//! - 由消息说明、原始文件名或时间戳生成文件名
//! - 计算目标目录并处理重名

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use chrono::Local;
use regex::Regex;
use tracing::debug;

use crate::persistence::{Channel, TaskStore};
use crate::platform::{ids_match, ChatRef, IncomingMessage, MediaInfo};

/// 文件名最大字符数（包含扩展名）
pub const MAX_FILE_NAME_CHARS: usize = 200;

/// 无法识别扩展名时使用的默认值
pub const DEFAULT_EXTENSION: &str = ".mp4";

/// 数据库中保存下载根目录的键
pub const DOWNLOAD_DIR_KEY: &str = "DOWNLOAD_DIR";

fn forbidden_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[\\/*?:"<>|]"#).expect("valid regex"))
}

fn whitespace_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid regex"))
}

/// 取出看起来像扩展名的后缀（不超过 10 个字母数字）
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => {
            let ext = &name[idx + 1..];
            if !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric())
            {
                (&name[..idx], &name[idx..])
            } else {
                (name, "")
            }
        }
        _ => (name, ""),
    }
}

/// 清理文件名
///
/// 删除非法字符、合并空白、去掉开头的点和空格，
/// 超过 200 个字符时截断主干部分并保留扩展名
pub fn sanitize_filename(name: &str) -> String {
    let stripped = forbidden_chars().replace_all(name, "");
    let collapsed = whitespace_runs().replace_all(&stripped, " ");
    let trimmed = collapsed.trim().trim_start_matches(['.', ' ']);

    if trimmed.chars().count() <= MAX_FILE_NAME_CHARS {
        return trimmed.to_string();
    }

    let (stem, ext) = split_extension(trimmed);
    let keep = MAX_FILE_NAME_CHARS.saturating_sub(ext.chars().count());
    let stem: String = stem.chars().take(keep).collect();
    format!("{}{}", stem.trim_end(), ext)
}

/// 生成不含扩展名的文件名
///
/// 优先级：说明首行（`#` 之前的部分）> 原始文件名 > 时间戳_消息ID
pub fn derive_base_name(message: &IncomingMessage) -> String {
    let caption = message
        .text
        .trim()
        .lines()
        .next()
        .and_then(|line| line.split('#').next())
        .map(str::trim)
        .unwrap_or("");

    let mut base = caption.to_string();

    if base.is_empty() {
        if let Some(original) = message.media.as_ref().and_then(|m| m.file_name.as_deref()) {
            base = Path::new(original)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("")
                .to_string();
        }
    }

    if base.is_empty() {
        let local = message.date.with_timezone(&Local);
        base = format!("{}_{}", local.format("%Y%m%d_%H%M%S"), message.id);
    }

    let sanitized = sanitize_filename(&base);
    if sanitized.is_empty() {
        format!("video_{}", message.id)
    } else {
        sanitized
    }
}

/// 媒体扩展名（带点）：原始文件名 > MIME 类型 > `.mp4`
pub fn media_extension(media: &MediaInfo) -> String {
    let from_name = media
        .file_name
        .as_deref()
        .and_then(|n| Path::new(n).extension())
        .and_then(|e| e.to_str())
        .map(|e| sanitize_filename(e))
        .filter(|e| !e.is_empty());
    if let Some(ext) = from_name {
        return format!(".{}", ext);
    }

    let from_mime = media.mime_type.as_deref().and_then(|mime| {
        let ext = match mime.to_ascii_lowercase().as_str() {
            "video/mp4" => ".mp4",
            "video/x-matroska" => ".mkv",
            "video/webm" => ".webm",
            "video/quicktime" => ".mov",
            "video/x-msvideo" => ".avi",
            "video/mpeg" => ".mpeg",
            "video/3gpp" => ".3gp",
            "video/x-flv" => ".flv",
            "audio/mpeg" => ".mp3",
            "audio/ogg" => ".ogg",
            "image/jpeg" => ".jpg",
            "image/png" => ".png",
            "image/gif" => ".gif",
            "application/pdf" => ".pdf",
            "application/zip" => ".zip",
            _ => return None,
        };
        Some(ext)
    });

    from_mime.unwrap_or(DEFAULT_EXTENSION).to_string()
}

/// 将保存的频道标识转换为订阅过滤项
///
/// 链接取最后一段，纯数字（可带负号）视为ID，其余视为用户名（去掉 `@`）
pub fn normalize_identifier(raw: &str) -> Option<ChatRef> {
    let mut id = raw.trim();
    if id.contains("t.me/") {
        id = id.trim_end_matches('/').rsplit('/').next().unwrap_or("");
    }
    let id = id.trim();
    if id.is_empty() {
        return None;
    }

    let digits = id.strip_prefix('-').unwrap_or(id);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(value) = id.parse::<i64>() {
            return Some(ChatRef::Id(value));
        }
    }

    let name = id.trim_start_matches('@');
    if name.is_empty() {
        None
    } else {
        Some(ChatRef::Username(name.to_string()))
    }
}

/// 按保存顺序匹配频道记录，返回第一个命中的
///
/// 规则：ID相等 / 补 `-100` 前缀后相等 / 用户名（忽略大小写与 `@`）/ 链接最后一段
pub fn match_channel<'a>(
    channels: &'a [Channel],
    chat_id: i64,
    username: Option<&str>,
) -> Option<&'a Channel> {
    channels.iter().find(|ch| {
        let stored = ch.channel_id.trim();
        if stored.is_empty() {
            return false;
        }
        if ids_match(stored, chat_id) {
            return true;
        }

        let Some(username) = username.map(|u| u.trim_start_matches('@')) else {
            return false;
        };
        if stored.trim_start_matches('@').eq_ignore_ascii_case(username) {
            return true;
        }
        if stored.contains('/') {
            let tail = stored.trim_end_matches('/').rsplit('/').next().unwrap_or("");
            return !tail.is_empty() && tail.eq_ignore_ascii_case(username);
        }
        false
    })
}

/// 目标目录：根目录，匹配到的频道有自定义子目录时追加
pub fn target_dir(root: &Path, channel: Option<&Channel>) -> PathBuf {
    let subdir = channel
        .and_then(|c| c.custom_path.as_deref())
        .map(|p| p.trim().trim_matches(['/', '\\']))
        .unwrap_or("");
    if subdir.is_empty() {
        root.to_path_buf()
    } else {
        root.join(subdir)
    }
}

/// 在目录中找到未被占用的文件名，冲突时追加 `_1`、`_2`…
pub fn unique_file_path<F>(
    dir: &Path,
    base: &str,
    extension: &str,
    mut is_taken: F,
) -> Result<(String, PathBuf)>
where
    F: FnMut(&Path) -> Result<bool>,
{
    let mut file_name = format!("{}{}", base, extension);
    let mut path = dir.join(&file_name);
    let mut counter = 1u32;

    while is_taken(&path)? {
        file_name = format!("{}_{}{}", base, counter, extension);
        path = dir.join(&file_name);
        counter += 1;
    }

    Ok((file_name, path))
}

/// 解析结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// 匹配到的频道记录ID
    pub channel_id: Option<i64>,
    pub file_name: String,
    pub file_path: PathBuf,
}

/// 单账号的频道解析器
#[derive(Clone)]
pub struct ChannelResolver {
    store: Arc<TaskStore>,
    account_id: i64,
    /// 数据库未设置下载目录时使用
    fallback_root: PathBuf,
}

impl ChannelResolver {
    pub fn new(store: Arc<TaskStore>, account_id: i64, fallback_root: PathBuf) -> Self {
        Self {
            store,
            account_id,
            fallback_root,
        }
    }

    /// 当前下载根目录
    pub fn download_root(&self) -> Result<PathBuf> {
        Ok(self
            .store
            .get_setting(DOWNLOAD_DIR_KEY)?
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.fallback_root.clone()))
    }

    /// 为消息确定目标频道、文件名和路径，并确保目录存在
    ///
    /// 本地已有文件或被未完成任务预留的路径都视为已占用
    pub async fn resolve(&self, message: &IncomingMessage) -> Result<Resolution> {
        let media = message.media.as_ref().context("消息不包含媒体")?;

        let channels = self.store.get_channels(Some(self.account_id))?;
        let matched = match_channel(&channels, message.chat_id, message.chat_username.as_deref());

        let dir = target_dir(&self.download_root()?, matched);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("创建下载目录失败: {:?}", dir))?;

        let base = derive_base_name(message);
        let extension = media_extension(media);
        let (file_name, file_path) = unique_file_path(&dir, &base, &extension, |path| {
            Ok(path.exists() || self.store.is_path_reserved(path)?)
        })?;

        debug!(
            "解析消息 {}:{} -> channel={:?}, path={:?}",
            message.chat_id,
            message.id,
            matched.map(|c| c.id),
            file_path
        );

        Ok(Resolution {
            channel_id: matched.map(|c| c.id),
            file_name,
            file_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{Account, NewTask};
    use crate::platform::mock::video_message;
    use crate::platform::MediaKind;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn channel(id: i64, channel_id: &str) -> Channel {
        Channel {
            id,
            account_id: 1,
            channel_id: channel_id.to_string(),
            channel_name: None,
            enabled: true,
            custom_path: None,
        }
    }

    fn media(file_name: Option<&str>, mime: Option<&str>) -> MediaInfo {
        MediaInfo {
            kind: MediaKind::Video,
            file_name: file_name.map(String::from),
            mime_type: mime.map(String::from),
            size: 1,
            location: "loc".into(),
        }
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename(r#"a/b\c*d?e:f"g<h>i|j"#), "abcdefghij");
        assert_eq!(sanitize_filename("  hello \t  world  "), "hello world");
        assert_eq!(sanitize_filename("...hidden"), "hidden");
        assert_eq!(sanitize_filename(". . .x"), "x");
        assert_eq!(sanitize_filename("???"), "");
    }

    #[test]
    fn test_sanitize_caps_length_keeps_extension() {
        let long = format!("{}.mkv", "a".repeat(300));
        let result = sanitize_filename(&long);
        assert_eq!(result.chars().count(), MAX_FILE_NAME_CHARS);
        assert!(result.ends_with(".mkv"));

        let unicode = "视".repeat(250);
        assert_eq!(sanitize_filename(&unicode).chars().count(), MAX_FILE_NAME_CHARS);
    }

    #[test]
    fn test_derive_base_name_priority() {
        let mut msg = video_message(-100, 7, "My Clip #tag #other\nsecond line", "x", 1);
        assert_eq!(derive_base_name(&msg), "My Clip");

        msg.text = "#onlytags".into();
        msg.media.as_mut().unwrap().file_name = Some("original name.mkv".into());
        assert_eq!(derive_base_name(&msg), "original name");

        msg.text = String::new();
        msg.media.as_mut().unwrap().file_name = None;
        let name = derive_base_name(&msg);
        assert!(name.ends_with("_7"), "{}", name);
        assert_eq!(name.len(), "YYYYmmdd_HHMMSS_7".len());

        msg.text = "???".into();
        assert_eq!(derive_base_name(&msg), "video_7");
    }

    #[test]
    fn test_media_extension() {
        assert_eq!(media_extension(&media(Some("a.MKV"), Some("video/mp4"))), ".MKV");
        assert_eq!(media_extension(&media(None, Some("video/webm"))), ".webm");
        assert_eq!(media_extension(&media(Some("noext"), Some("video/quicktime"))), ".mov");
        assert_eq!(media_extension(&media(None, Some("application/x-unknown"))), ".mp4");
        assert_eq!(media_extension(&media(None, None)), ".mp4");
    }

    #[test]
    fn test_normalize_identifier() {
        assert_eq!(normalize_identifier("-100123"), Some(ChatRef::Id(-100123)));
        assert_eq!(normalize_identifier(" 123456 "), Some(ChatRef::Id(123456)));
        assert_eq!(normalize_identifier("@News"), Some(ChatRef::Username("News".into())));
        assert_eq!(
            normalize_identifier("https://t.me/news/"),
            Some(ChatRef::Username("news".into()))
        );
        assert_eq!(normalize_identifier("t.me/-100999"), Some(ChatRef::Id(-100999)));
        assert_eq!(normalize_identifier("   "), None);
        assert_eq!(normalize_identifier("@"), None);
    }

    #[test]
    fn test_match_channel_rules() {
        let channels = vec![channel(1, "123456")];
        assert_eq!(match_channel(&channels, -100123456, None).map(|c| c.id), Some(1));

        let channels = vec![channel(2, "-100777")];
        assert_eq!(match_channel(&channels, 777, None).map(|c| c.id), Some(2));

        let channels = vec![channel(3, "news")];
        assert_eq!(match_channel(&channels, 5, Some("News")).map(|c| c.id), Some(3));

        let channels = vec![channel(4, "@News")];
        assert_eq!(match_channel(&channels, 5, Some("news")).map(|c| c.id), Some(4));

        let channels = vec![channel(5, "t.me/news")];
        assert_eq!(match_channel(&channels, 5, Some("News")).map(|c| c.id), Some(5));

        let channels = vec![channel(6, "https://t.me/other")];
        assert!(match_channel(&channels, 5, Some("News")).is_none());

        // 部分包含不算命中
        let channels = vec![channel(7, "23456")];
        assert!(match_channel(&channels, -100123456, None).is_none());
    }

    #[test]
    fn test_match_channel_first_wins() {
        let channels = vec![channel(10, "news"), channel(11, "-100500")];
        assert_eq!(match_channel(&channels, -100500, Some("news")).map(|c| c.id), Some(10));
    }

    #[test]
    fn test_target_dir() {
        let root = Path::new("/data");
        let mut ch = channel(1, "x");
        assert_eq!(target_dir(root, None), PathBuf::from("/data"));
        assert_eq!(target_dir(root, Some(&ch)), PathBuf::from("/data"));
        ch.custom_path = Some(" /movies/2024/ ".into());
        assert_eq!(target_dir(root, Some(&ch)), PathBuf::from("/data/movies/2024"));
        ch.custom_path = Some("//".into());
        assert_eq!(target_dir(root, Some(&ch)), PathBuf::from("/data"));
    }

    #[test]
    fn test_unique_file_path_suffixes() {
        let dir = Path::new("/d");
        let taken: HashSet<PathBuf> = ["/d/a.mp4", "/d/a_1.mp4"].iter().map(PathBuf::from).collect();
        let (name, path) = unique_file_path(dir, "a", ".mp4", |p| Ok(taken.contains(p))).unwrap();
        assert_eq!(name, "a_2.mp4");
        assert_eq!(path, PathBuf::from("/d/a_2.mp4"));
    }

    #[tokio::test]
    async fn test_resolver_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let account_id = store
            .add_account(&Account {
                id: 0,
                name: "a".into(),
                api_id: 1,
                api_hash: "h".into(),
                bot_token: Some("t".into()),
                session_name: "s".into(),
            })
            .unwrap();
        let mut ch = channel(0, "news");
        ch.account_id = account_id;
        ch.custom_path = Some("/sub/".into());
        let channel_id = store.add_channel(&ch).unwrap();
        store.set_setting(DOWNLOAD_DIR_KEY, tmp.path()).unwrap();

        let resolver = ChannelResolver::new(store.clone(), account_id, PathBuf::from("/unused"));
        let mut msg = video_message(-1001, 3, "Clip", "loc", 10);
        msg.chat_username = Some("NEWS".into());

        let first = resolver.resolve(&msg).await.unwrap();
        assert_eq!(first.channel_id, Some(channel_id));
        assert_eq!(first.file_name, "Clip.mp4");
        assert_eq!(first.file_path, tmp.path().join("sub").join("Clip.mp4"));
        assert!(tmp.path().join("sub").is_dir());

        // 已被未完成任务预留的路径
        store
            .add_task(&NewTask {
                account_id,
                channel_id: first.channel_id,
                source_chat_id: -1001,
                source_message_id: 3,
                file_name: first.file_name.clone(),
                file_path: first.file_path.clone(),
            })
            .unwrap();
        let second = resolver.resolve(&msg).await.unwrap();
        assert_eq!(second.file_name, "Clip_1.mp4");

        // 磁盘上已存在的文件
        std::fs::write(&second.file_path, b"x").unwrap();
        let third = resolver.resolve(&msg).await.unwrap();
        assert_eq!(third.file_name, "Clip_2.mp4");

        // 未匹配的会话使用根目录
        let other = video_message(-1002, 4, "Other", "loc", 10);
        let res = resolver.resolve(&other).await.unwrap();
        assert_eq!(res.channel_id, None);
        assert_eq!(res.file_path, tmp.path().join("Other.mp4"));
    }

    proptest! {
        #[test]
        fn prop_sanitize_output_is_clean(input in "\\PC{0,400}") {
            let out = sanitize_filename(&input);
            prop_assert!(!out.chars().any(|c| r#"\/*?:"<>|"#.contains(c)));
            prop_assert!(!out.starts_with('.') && !out.starts_with(' '));
            prop_assert!(out.chars().count() <= MAX_FILE_NAME_CHARS);
            prop_assert!(!out.contains("  "));
        }

        #[test]
        fn prop_unique_path_is_never_taken(taken_count in 0usize..20) {
            let dir = Path::new("/d");
            let mut taken: HashSet<PathBuf> = HashSet::new();
            taken.insert(dir.join("v.mp4"));
            for i in 1..=taken_count {
                taken.insert(dir.join(format!("v_{}.mp4", i)));
            }
            let (_, path) = unique_file_path(dir, "v", ".mp4", |p| Ok(taken.contains(p))).unwrap();
            prop_assert!(!taken.contains(&path));
            let expected = if taken_count == 0 { dir.join("v_1.mp4") } else { dir.join(format!("v_{}.mp4", taken_count + 1)) };
            prop_assert_eq!(path, expected);
        }

        #[test]
        fn prop_numeric_ids_match_with_prefix(id in 1i64..1_000_000_000_000) {
            let stored = id.to_string();
            let real: i64 = format!("-100{}", id).parse().unwrap();
            let channels = vec![channel(1, &stored)];
            prop_assert!(match_channel(&channels, real, None).is_some());
        }
    }
}
