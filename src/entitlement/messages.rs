//! Notices shown when the subscription state changes.

pub(crate) const UPGRADED_CTA: &str = "\
╔══════════════════════════════════════════════════════════════════════════════════╗
║ WELCOME TO PRO                                                                   ║
║                                                                                  ║
║ Your Pro subscription is active. Survey creation and downloads are now           ║
║ unlimited for this account.                                                      ║
║                                                                                  ║
║ Manage your subscription:                                                        ║
║ testimonial-quota portal                                                         ║
╚══════════════════════════════════════════════════════════════════════════════════╝";
