mod wechat_signature;

pub use wechat_signature::{WechatNotification, WechatSignatureFactory, WechatSignatureService};
