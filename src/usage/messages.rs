//! Notices shown when a monthly usage limit blocks an action.

pub(crate) const FREE_SURVEY_LIMIT_CTA: &str = "\
╔══════════════════════════════════════════════════════════════════════════════════╗
║ SURVEY LIMIT REACHED                                                             ║
║                                                                                  ║
║ You have created the maximum number of surveys for the Free plan this month.     ║
║ New surveys can be created again at the start of next month.                     ║
║                                                                                  ║
║ To create unlimited surveys, upgrade to Pro:                                     ║
║ testimonial-quota checkout                                                       ║
╚══════════════════════════════════════════════════════════════════════════════════╝";

pub(crate) const FREE_RESPONSE_LIMIT_CTA: &str = "\
╔══════════════════════════════════════════════════════════════════════════════════╗
║ TESTIMONIAL LIMIT REACHED                                                        ║
║                                                                                  ║
║ You have collected the maximum number of testimonials for the Free plan this     ║
║ month. Collection resumes automatically at the start of next month.              ║
║                                                                                  ║
║ To collect more testimonials, upgrade to Pro:                                    ║
║ testimonial-quota checkout                                                       ║
╚══════════════════════════════════════════════════════════════════════════════════╝";

pub(crate) const FREE_DOWNLOAD_LIMIT_CTA: &str = "\
╔══════════════════════════════════════════════════════════════════════════════════╗
║ DOWNLOAD LIMIT REACHED                                                           ║
║                                                                                  ║
║ You have used every download included in the Free plan this month.               ║
║ Downloads become available again at the start of next month.                     ║
║                                                                                  ║
║ For unlimited downloads, upgrade to Pro:                                         ║
║ testimonial-quota checkout                                                       ║
╚══════════════════════════════════════════════════════════════════════════════════╝";

pub(crate) const PRO_RESPONSE_LIMIT_CTA: &str = "\
╔══════════════════════════════════════════════════════════════════════════════════╗
║ PRO TESTIMONIAL LIMIT REACHED                                                    ║
║                                                                                  ║
║ You have collected the maximum number of testimonials included in the Pro plan   ║
║ this month. Collection resumes automatically at the start of next month.         ║
║                                                                                  ║
║ Manage your subscription:                                                        ║
║ testimonial-quota portal                                                         ║
╚══════════════════════════════════════════════════════════════════════════════════╝";
