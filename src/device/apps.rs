use std::collections::HashMap;
use std::path::Path;

use crate::errors::{PilotError, PilotResult};

const BUILTIN_APPS: &[(&str, &str)] = &[
    ("微信", "com.tencent.mm"),
    ("WeChat", "com.tencent.mm"),
    ("QQ", "com.tencent.mobileqq"),
    ("QQ音乐", "com.tencent.qqmusic"),
    ("微博", "com.sina.weibo"),
    ("淘宝", "com.taobao.taobao"),
    ("京东", "com.jingdong.app.mall"),
    ("拼多多", "com.xunmeng.pinduoduo"),
    ("小红书", "com.xingin.xhs"),
    ("知乎", "com.zhihu.android"),
    ("高德地图", "com.autonavi.minimap"),
    ("百度地图", "com.baidu.BaiduMap"),
    ("美团", "com.sankuai.meituan"),
    ("大众点评", "com.dianping.v1"),
    ("饿了么", "me.ele"),
    ("携程", "ctrip.android.view"),
    ("12306", "com.MobileTicket"),
    ("滴滴出行", "com.sdu.did.psnger"),
    ("bilibili", "tv.danmaku.bili"),
    ("抖音", "com.ss.android.ugc.aweme"),
    ("快手", "com.smile.gifmaker"),
    ("网易云音乐", "com.netease.cloudmusic"),
    ("飞书", "com.ss.android.lark"),
    ("今日头条", "com.ss.android.article.news"),
    ("Settings", "com.android.settings"),
    ("Android System Settings", "com.android.settings"),
    ("Chrome", "com.android.chrome"),
    ("Clock", "com.android.deskclock"),
    ("Contacts", "com.android.contacts"),
    ("Gmail", "com.google.android.gm"),
    ("Google Maps", "com.google.android.apps.maps"),
    ("Google Calendar", "com.google.android.calendar"),
    ("Google Drive", "com.google.android.apps.docs"),
    ("Google Play Store", "com.android.vending"),
    ("Telegram", "org.telegram.messenger"),
    ("TikTok", "com.zhiliaoapp.musically"),
    ("Twitter", "com.twitter.android"),
    ("X", "com.twitter.android"),
    ("WhatsApp", "com.whatsapp"),
    ("Reddit", "com.reddit.frontpage"),
];

/// App display name → package identifier.
#[derive(Debug, Clone)]
pub struct AppRegistry {
    apps: HashMap<String, String>,
}

impl Default for AppRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AppRegistry {
    pub fn builtin() -> Self {
        Self {
            apps: BUILTIN_APPS
                .iter()
                .map(|(name, pkg)| (name.to_string(), pkg.to_string()))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            apps: HashMap::new(),
        }
    }

    /// Built-in table with entries from a JSON object file merged on top.
    pub fn with_overrides(path: &Path) -> PilotResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let extra: HashMap<String, String> = serde_json::from_str(&content).map_err(|e| {
            PilotError::Config(format!("app mapping {}: {e}", path.display()))
        })?;
        let mut registry = Self::builtin();
        tracing::info!(path = %path.display(), entries = extra.len(), "app mappings loaded");
        registry.apps.extend(extra);
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, package: impl Into<String>) {
        self.apps.insert(name.into(), package.into());
    }

    /// Exact name, then case-insensitive.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        let name = name.trim();
        if let Some(pkg) = self.apps.get(name) {
            return Some(pkg.as_str());
        }
        let lowered = name.to_lowercase();
        self.apps
            .iter()
            .find(|(k, _)| k.to_lowercase() == lowered)
            .map(|(_, pkg)| pkg.as_str())
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
